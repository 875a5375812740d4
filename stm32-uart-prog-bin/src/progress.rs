use indicatif::{ProgressBar, ProgressStyle};

use stm32_uart_prog::pipeline::ProgressSink;

/// Renders pipeline progress on a single indicatif bar spanning every
/// target's chunk count, mirroring the original tool's one `tqdm` total bar.
pub struct IndicatifSink {
    bar: ProgressBar,
}

impl IndicatifSink {
    pub fn new(total_chunks: u64) -> Self {
        let bar = ProgressBar::new(total_chunks);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("Tot [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} chunks {msg}")
                .progress_chars("##-"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for IndicatifSink {
    fn credit(&mut self, chunks: usize) {
        self.bar.inc(chunks as u64);
    }

    fn rollback(&mut self, chunks: usize) {
        self.bar.set_position(self.bar.position().saturating_sub(chunks as u64));
    }

    fn set_sector(&mut self, target_id: u16, sector_index: usize, sector_ordinal: usize, total_sectors: usize) {
        self.bar
            .set_message(format!("id={target_id} sector={sector_ordinal}/{total_sectors} (#{sector_index})"));
    }

    fn write_line(&mut self, message: &str) {
        self.bar.println(format!("\t{message}"));
    }
}
