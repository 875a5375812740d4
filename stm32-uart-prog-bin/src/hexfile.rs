use anyhow::{bail, Context};
use ihex::{Reader, Record};

use stm32_uart_prog::image::PAD_BYTE;

/// Flattened view of an Intel-HEX file: a contiguous `0xFF`-padded buffer
/// and the address range it occupies.
pub struct HexImage {
    pub data: Vec<u8>,
    pub min_addr: u32,
    pub max_addr: u32,
}

/// Parses `path` as Intel-HEX, resolving `:04`/extended-linear-address
/// records into absolute 32-bit addresses, and returns the minimal
/// contiguous buffer spanning every data record, padded with [`PAD_BYTE`].
pub fn load(path: &str) -> anyhow::Result<HexImage> {
    if !path.ends_with(".hex") {
        bail!("only .hex files are supported");
    }
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading hex file {path}"))?;

    let mut upper_linear: u32 = 0;
    let mut spans: Vec<(u32, Vec<u8>)> = Vec::new();

    for record in Reader::new(&contents) {
        match record.with_context(|| format!("parsing hex file {path}"))? {
            Record::Data { offset, value } => {
                let addr = upper_linear | (offset as u32);
                spans.push((addr, value));
            }
            Record::ExtendedLinearAddress(upper) => {
                upper_linear = (upper as u32) << 16;
            }
            Record::ExtendedSegmentAddress(segment) => {
                upper_linear = (segment as u32) << 4;
            }
            Record::EndOfFile => break,
            Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
        }
    }

    if spans.is_empty() {
        bail!("hex file {path} contains no data records");
    }

    let min_addr = spans.iter().map(|(addr, _)| *addr).min().unwrap();
    let max_addr = spans
        .iter()
        .map(|(addr, value)| addr + value.len() as u32 - 1)
        .max()
        .unwrap();

    let size = (max_addr - min_addr + 1) as usize;
    let mut data = vec![PAD_BYTE; size];
    for (addr, value) in spans {
        let offset = (addr - min_addr) as usize;
        data[offset..offset + value.len()].copy_from_slice(&value);
    }

    Ok(HexImage { data, min_addr, max_addr })
}
