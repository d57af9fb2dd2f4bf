//! Watch-list filtering of chain events.
//!
//! A watch-list entry is either a bare event type (`"scope_created"`) or an
//! event type and attribute key joined by a colon (`"scope_created:group_id"`).

use saga_collab::{ChainEvent, StreamBlock};

/// Whether `event` passes the watch list. An empty list passes everything.
pub fn should_stream(watch_list: &[String], event: &ChainEvent) -> bool {
    if watch_list.is_empty() {
        return true;
    }
    watch_list.iter().any(|entry| match entry.split_once(':') {
        Some((event_type, key)) => {
            event_type == event.event_type && event.attribute(key).is_some()
        }
        None => *entry == event.event_type,
    })
}

/// Drop every event that fails the watch list. Transactions are kept even when
/// none of their events pass, so their outcome codes stay visible.
pub fn filter_block(watch_list: &[String], mut block: StreamBlock) -> StreamBlock {
    if watch_list.is_empty() {
        return block;
    }
    for tx in &mut block.txs {
        tx.events.retain(|event| should_stream(watch_list, event));
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_collab::TxResult;
    use saga_types::{Timestamp, TxHash};

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_list_streams_everything() {
        assert!(should_stream(&[], &ChainEvent::new("foo")));
        assert!(should_stream(&[], &ChainEvent::new("anything")));
    }

    #[test]
    fn bare_type_matches_type_only() {
        let watch = list(&["foo"]);
        assert!(should_stream(&watch, &ChainEvent::new("foo")));
        assert!(should_stream(
            &watch,
            &ChainEvent::new("foo").with_attribute("bar", "1")
        ));
        assert!(!should_stream(&watch, &ChainEvent::new("foobar")));
    }

    #[test]
    fn type_and_attribute_requires_the_attribute() {
        let watch = list(&["foo:bar"]);
        assert!(!should_stream(&watch, &ChainEvent::new("foo")));
        assert!(should_stream(
            &watch,
            &ChainEvent::new("foo").with_attribute("bar", "x")
        ));
        assert!(!should_stream(
            &watch,
            &ChainEvent::new("baz").with_attribute("bar", "x")
        ));
    }

    #[test]
    fn filtering_keeps_transactions() {
        let block = StreamBlock {
            height: 5,
            time: Timestamp::from_secs(5),
            txs: vec![TxResult {
                hash: TxHash::new([1; 32]),
                code: 11,
                raw_log: "out of gas".into(),
                events: vec![ChainEvent::new("transfer"), ChainEvent::new("scope_created")],
            }],
        };
        let filtered = filter_block(&list(&["scope_created"]), block);
        assert_eq!(filtered.txs.len(), 1);
        assert_eq!(filtered.txs[0].events, vec![ChainEvent::new("scope_created")]);
    }
}
