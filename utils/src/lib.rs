use std::time::SystemTime;

pub fn get_epoch_time_in_ms() -> u64 {
    let start = SystemTime::now();
    let since_the_epoch = start
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH");
    since_the_epoch.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::get_epoch_time_in_ms;

    #[test]
    fn test_epoch_time_is_monotonic_enough() {
        let first = get_epoch_time_in_ms();
        let second = get_epoch_time_in_ms();
        assert!(second >= first);
        // sanity: well past 2020-01-01
        assert!(first > 1_577_836_800_000);
    }
}
