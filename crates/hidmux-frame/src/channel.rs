//! Reserved channel IDs.
//!
//! Channel IDs are allocated monotonically per stack and never reused.
//! The first allocation is always the control channel.

/// Control plane (method calls, channel lifecycle, shutdown).
pub const CONTROL: u32 = 0;

/// Returns true if the channel ID is the control channel.
pub fn is_control(id: u32) -> bool {
    id == CONTROL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_zero_is_control() {
        assert!(is_control(0));
        assert!(!is_control(1));
        assert!(!is_control(u32::MAX));
    }
}
