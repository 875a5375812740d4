use std::time::Duration;

/// Formats `elapsed` as `d`/`h`/`min`/`s`/`ms` segments, each included once
/// any larger segment has already been, with milliseconds always present.
pub fn format_duration(elapsed: Duration) -> String {
    let total_ms = elapsed.as_millis();
    let ms = (total_ms % 1000) as u64;
    let total_secs = total_ms / 1000;

    let days = total_secs / 86_400;
    let rem = total_secs % 86_400;
    let hours = rem / 3_600;
    let rem = rem % 3_600;
    let minutes = rem / 60;
    let seconds = rem % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 || !parts.is_empty() {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || !parts.is_empty() {
        parts.push(format!("{minutes}min"));
    }
    if seconds > 0 || !parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.push(format!("{ms}ms"));
    parts.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_second_duration_is_just_milliseconds() {
        assert_eq!(format_duration(Duration::from_millis(123)), "123ms");
    }

    #[test]
    fn seconds_and_milliseconds_are_both_present_once_a_second_has_elapsed() {
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1s-500ms");
    }

    #[test]
    fn larger_units_force_smaller_ones_to_appear_even_when_zero() {
        assert_eq!(format_duration(Duration::from_secs(3_600)), "1h-0min-0s-0ms");
    }

    #[test]
    fn days_hours_minutes_seconds_and_milliseconds_all_compose() {
        let secs = 1 * 86_400 + 2 * 3_600 + 3 * 60 + 4;
        let elapsed = Duration::from_secs(secs) + Duration::from_millis(5);
        assert_eq!(format_duration(elapsed), "1d-2h-3min-4s-5ms");
    }
}
