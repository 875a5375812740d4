use std::fmt;

/// Final state of one target's programming attempt, written exactly once
/// by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus {
    Undefined,
    Success,
    /// Programmed, but at least one chunk or erase attempt needed a retry.
    Warning,
    Fail,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Undefined => "undefined",
            TargetStatus::Success => "success",
            TargetStatus::Warning => "warning",
            TargetStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}
