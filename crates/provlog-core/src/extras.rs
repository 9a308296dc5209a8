use std::collections::BTreeMap;

use tracing::warn;

use crate::artifact::ExtraValue;

/// One registered key: either a single value, or the ordered sequence it
/// grew into through non-overwriting re-registration.
#[derive(Debug)]
pub enum ExtraEntry {
    Single(ExtraValue),
    Many(Vec<ExtraValue>),
}

/// In-memory store for arbitrary side data attached to a run.
#[derive(Debug, Default)]
pub struct ExtraStore {
    entries: BTreeMap<String, ExtraEntry>,
}

impl ExtraStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&ExtraEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExtraEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Register `value` under `key`.
    ///
    /// A repeated key with `overwrite` discards the previous state (with a
    /// warning) and starts over as a single value. Without `overwrite`, the
    /// entry converts to a sequence on the second registration and appends
    /// from then on.
    pub fn add(&mut self, key: &str, value: ExtraValue, overwrite: bool) {
        let next = match self.entries.remove(key) {
            None => ExtraEntry::Single(value),
            Some(previous) => {
                if overwrite {
                    warn!("overwriting extra key '{}'", key);
                    ExtraEntry::Single(value)
                } else {
                    match previous {
                        ExtraEntry::Single(first) => ExtraEntry::Many(vec![first, value]),
                        ExtraEntry::Many(mut seq) => {
                            seq.push(value);
                            ExtraEntry::Many(seq)
                        }
                    }
                }
            }
        };
        self.entries.insert(key.to_string(), next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar(value: serde_json::Value) -> ExtraValue {
        ExtraValue::Scalar(value)
    }

    fn as_values(entry: &ExtraEntry) -> Vec<&serde_json::Value> {
        match entry {
            ExtraEntry::Single(ExtraValue::Scalar(v)) => vec![v],
            ExtraEntry::Many(seq) => seq
                .iter()
                .map(|v| match v {
                    ExtraValue::Scalar(v) => v,
                    ExtraValue::Artifact(_) => panic!("unexpected artifact"),
                })
                .collect(),
            ExtraEntry::Single(ExtraValue::Artifact(_)) => panic!("unexpected artifact"),
        }
    }

    #[test]
    fn accumulation_grows_an_ordered_sequence() {
        let mut store = ExtraStore::new();
        store.add("k", scalar(json!(1)), false);
        store.add("k", scalar(json!(2)), false);
        store.add("k", scalar(json!(3)), false);

        let entry = store.get("k").expect("entry");
        assert!(matches!(entry, ExtraEntry::Many(_)));
        assert_eq!(as_values(entry), vec![&json!(1), &json!(2), &json!(3)]);
    }

    #[test]
    fn first_registration_stays_single() {
        let mut store = ExtraStore::new();
        store.add("k", scalar(json!("only")), false);
        let entry = store.get("k").expect("entry");
        assert!(matches!(entry, ExtraEntry::Single(_)));
        assert_eq!(as_values(entry), vec![&json!("only")]);
    }

    #[test]
    fn overwrite_collapses_a_sequence_back_to_single() {
        let mut store = ExtraStore::new();
        store.add("k", scalar(json!(1)), false);
        store.add("k", scalar(json!(2)), false);
        store.add("k", scalar(json!(99)), true);

        let entry = store.get("k").expect("entry");
        assert!(matches!(entry, ExtraEntry::Single(_)));
        assert_eq!(as_values(entry), vec![&json!(99)]);

        // subsequent non-overwriting adds accumulate again
        store.add("k", scalar(json!(100)), false);
        let entry = store.get("k").expect("entry");
        assert_eq!(as_values(entry), vec![&json!(99), &json!(100)]);
    }

    #[test]
    fn distinct_keys_do_not_interact() {
        let mut store = ExtraStore::new();
        store.add("a", scalar(json!(1)), false);
        store.add("b", scalar(json!(2)), false);
        store.add("a", scalar(json!(3)), false);

        assert_eq!(store.len(), 2);
        assert!(matches!(store.get("b"), Some(ExtraEntry::Single(_))));
        assert!(matches!(store.get("a"), Some(ExtraEntry::Many(_))));
    }
}
