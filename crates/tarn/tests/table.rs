//! Tests for the insertion-ordered table through its public API.

use pretty_assertions::assert_eq;
use tarn::{ImmediateKeys, KeyContext, RunResult, Table, Value};

/// Sends every key to the same bucket, so every lookup walks the probe sequence.
struct Colliding;

impl KeyContext for Colliding {
    fn key_hash(&self, _key: Value) -> RunResult<u32> {
        Ok(0)
    }

    fn keys_equal(&self, a: Value, b: Value) -> RunResult<bool> {
        Ok(a.numeric_eq(b).unwrap_or(false))
    }
}

fn ints(table: &Table) -> Vec<(i64, i64)> {
    table
        .iter()
        .map(|(k, v)| (k.as_int().unwrap(), v.as_int().unwrap()))
        .collect()
}

#[test]
fn iteration_follows_insertion_order() {
    let mut table = Table::new();
    for key in [5, 3, 9, 1] {
        assert!(table.set(&ImmediateKeys, Value::Int(key), Value::Int(key * 10)).unwrap());
    }
    assert!(!table.set(&ImmediateKeys, Value::Int(3), Value::Int(33)).unwrap());
    assert_eq!(ints(&table), [(5, 50), (3, 33), (9, 90), (1, 10)]);
}

#[test]
fn deleted_key_reinserted_goes_to_the_end() {
    let mut table = Table::new();
    for key in 0..4 {
        table.set(&ImmediateKeys, Value::Int(key), Value::Int(key)).unwrap();
    }
    assert!(table.delete(&ImmediateKeys, Value::Int(1)).unwrap());
    assert!(!table.delete(&ImmediateKeys, Value::Int(1)).unwrap());
    table.set(&ImmediateKeys, Value::Int(1), Value::Int(100)).unwrap();
    assert_eq!(ints(&table), [(0, 0), (2, 2), (3, 3), (1, 100)]);
    assert_eq!(table.len(), 4);
}

#[test]
fn equal_numbers_share_an_entry() {
    let mut table = Table::new();
    table.set(&ImmediateKeys, Value::Int(3), Value::Int(1)).unwrap();
    assert!(!table.set(&ImmediateKeys, Value::Float(3.0), Value::Int(2)).unwrap());
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(&ImmediateKeys, Value::Int(3)).unwrap(), Some(Value::Int(2)));
}

#[test]
fn exact_delete_ignores_equal_keys() {
    let mut table = Table::new();
    table.set(&ImmediateKeys, Value::Int(3), Value::None).unwrap();
    assert!(!table.delete_exact(&ImmediateKeys, Value::Float(3.0)).unwrap());
    assert!(table.delete_exact(&ImmediateKeys, Value::Int(3)).unwrap());
    assert!(table.is_empty());
}

#[test]
fn heap_keys_are_rejected_by_immediate_context() {
    let mut table = Table::new();
    let err = table.set(&ImmediateKeys, Value::Ref(tarn::HeapId::from_index(0)), Value::None);
    assert!(err.is_err());
}

#[test]
fn set_if_exists_never_inserts() {
    let mut table = Table::new();
    assert!(!table.set_if_exists(&ImmediateKeys, Value::Int(1), Value::Int(1)).unwrap());
    assert!(table.is_empty());
    table.set(&ImmediateKeys, Value::Int(1), Value::Int(1)).unwrap();
    assert!(table.set_if_exists(&ImmediateKeys, Value::Int(1), Value::Int(2)).unwrap());
    assert_eq!(table.get(&ImmediateKeys, Value::Int(1)).unwrap(), Some(Value::Int(2)));
}

#[test]
fn colliding_keys_survive_growth_and_deletion() {
    let mut table = Table::new();
    for key in 0..50 {
        table.set(&Colliding, Value::Int(key), Value::Int(-key)).unwrap();
    }
    for key in (0..50).step_by(2) {
        assert!(table.delete(&Colliding, Value::Int(key)).unwrap());
    }
    for key in 0..50 {
        let expected = (key % 2 == 1).then_some(Value::Int(-key));
        assert_eq!(table.get(&Colliding, Value::Int(key)).unwrap(), expected, "key {key}");
    }
    assert_eq!(table.len(), 25);
    assert!(table.capacity() * 3 >= table.used() * 4);
}

#[test]
fn add_all_overwrites_and_appends() {
    let mut base = Table::new();
    base.set(&ImmediateKeys, Value::Int(1), Value::Int(1)).unwrap();
    base.set(&ImmediateKeys, Value::Int(2), Value::Int(2)).unwrap();
    let mut extra = Table::new();
    extra.set(&ImmediateKeys, Value::Int(3), Value::Int(3)).unwrap();
    extra.set(&ImmediateKeys, Value::Int(1), Value::Int(10)).unwrap();
    base.add_all(&ImmediateKeys, &extra).unwrap();
    assert_eq!(ints(&base), [(1, 10), (2, 2), (3, 3)]);
}

#[test]
fn retain_compacts_the_survivors() {
    let mut table = Table::new();
    for key in 0..10 {
        table.set(&ImmediateKeys, Value::Int(key), Value::Int(key)).unwrap();
    }
    table.retain(|key, _| key.as_int().is_some_and(|k| k >= 7));
    assert_eq!(ints(&table), [(7, 7), (8, 8), (9, 9)]);
    assert_eq!(table.used(), 3);
}

#[test]
fn next_entry_skips_gaps() {
    let mut table = Table::new();
    for key in 0..3 {
        table.set(&ImmediateKeys, Value::Int(key), Value::None).unwrap();
    }
    table.delete(&ImmediateKeys, Value::Int(1)).unwrap();
    let (position, key, _) = table.next_entry(1).unwrap();
    assert_eq!((position, key.as_int()), (2, Some(2)));
    assert_eq!(table.next_entry(3), None);
}

/// Checks the counting invariants against a plain insertion-ordered model.
fn check_against(table: &Table, model: &[(i64, i64)], step: usize) {
    assert_eq!(table.iter().count(), table.len(), "live count at step {step}");
    assert!(
        table.used() <= table.capacity(),
        "used {} exceeds capacity {} at step {step}",
        table.used(),
        table.capacity()
    );
    assert!(table.len() <= table.used(), "count exceeds used at step {step}");
    assert_eq!(table.len(), model.len(), "model size at step {step}");
}

fn churn(ctx: &impl KeyContext, steps: usize, key_range: u64) {
    let mut table = Table::new();
    let mut model: Vec<(i64, i64)> = Vec::new();
    let mut state = 0x2545_f491_4f6c_dd1d_u64;
    for step in 0..steps {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let key = i64::try_from(state % key_range).unwrap();
        if state % 3 == 0 {
            let removed = table.delete(ctx, Value::Int(key)).unwrap();
            let position = model.iter().position(|&(k, _)| k == key);
            assert_eq!(removed, position.is_some(), "delete of {key} at step {step}");
            if let Some(position) = position {
                model.remove(position);
            }
        } else {
            let value = i64::try_from(step).unwrap();
            let is_new = table.set(ctx, Value::Int(key), Value::Int(value)).unwrap();
            match model.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => {
                    assert!(!is_new, "overwrite of {key} at step {step}");
                    entry.1 = value;
                }
                None => {
                    assert!(is_new, "insert of {key} at step {step}");
                    model.push((key, value));
                }
            }
        }
        check_against(&table, &model, step);
    }
    assert_eq!(ints(&table), model);
}

#[test]
fn mixed_churn_keeps_count_and_order() {
    churn(&ImmediateKeys, 5_000, 200);
}

#[test]
fn mixed_churn_with_colliding_hashes() {
    churn(&Colliding, 600, 40);
}
