//! Last-writer-wins ordering of record versions returned by replicas.

use kvproxy_common::Message;

/// Returns `true` if `a` holds a strictly more recent record than `b`.
///
/// When both carry a last-modification time, it decides alone. Otherwise
/// the later creation time wins, then the higher version, then the longer
/// TTL. Originator ids never take part, and a full tie returns `false` so
/// an incumbent keeps its place.
pub fn is_more_recent(a: &Message, b: &Message) -> bool {
    if a.last_modification_time != 0 && b.last_modification_time != 0 {
        return a.last_modification_time > b.last_modification_time;
    }
    (a.creation_time, a.version, a.ttl) > (b.creation_time, b.version, b.ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvproxy_common::RequestId;

    fn rec(lmt: u64, ct: u32, version: u32, ttl: u32) -> Message {
        Message {
            last_modification_time: lmt,
            creation_time: ct,
            version,
            ttl,
            ..Default::default()
        }
    }

    #[test]
    fn test_lmt_decides_when_both_set() {
        // Older creation time but newer modification still wins.
        let a = rec(200, 1, 1, 1);
        let b = rec(100, 50, 9, 9);
        assert!(is_more_recent(&a, &b));
        assert!(!is_more_recent(&b, &a));
    }

    #[test]
    fn test_equal_lmt_is_not_more_recent() {
        let a = rec(100, 5, 5, 5);
        let b = rec(100, 1, 1, 1);
        assert!(!is_more_recent(&a, &b));
        assert!(!is_more_recent(&b, &a));
    }

    #[test]
    fn test_falls_back_to_creation_time_when_one_lmt_missing() {
        let a = rec(0, 20, 1, 1);
        let b = rec(500, 10, 9, 9);
        assert!(is_more_recent(&a, &b));
        assert!(!is_more_recent(&b, &a));
    }

    #[test]
    fn test_version_breaks_creation_time_tie() {
        let a = rec(0, 10, 3, 1);
        let b = rec(0, 10, 2, 100);
        assert!(is_more_recent(&a, &b));
        assert!(!is_more_recent(&b, &a));
    }

    #[test]
    fn test_ttl_breaks_version_tie() {
        let a = rec(0, 10, 3, 60);
        let b = rec(0, 10, 3, 30);
        assert!(is_more_recent(&a, &b));
        assert!(!is_more_recent(&b, &a));
    }

    #[test]
    fn test_full_tie_keeps_incumbent() {
        let a = rec(0, 10, 3, 60);
        let b = a.clone();
        assert!(!is_more_recent(&a, &b));
    }

    #[test]
    fn test_originator_is_ignored() {
        let mut a = rec(0, 10, 3, 60);
        let mut b = rec(0, 10, 2, 60);
        a.originator = RequestId::new();
        b.originator = RequestId::new();
        assert!(is_more_recent(&a, &b));

        b.originator = RequestId::ZERO;
        assert!(is_more_recent(&a, &b));
        assert!(!is_more_recent(&b, &a));
    }

    #[test]
    fn test_zero_record_loses_to_anything() {
        let empty = Message::default();
        assert!(is_more_recent(&rec(0, 0, 0, 1), &empty));
        assert!(!is_more_recent(&empty, &rec(0, 0, 0, 1)));
    }
}
