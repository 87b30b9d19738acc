use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tarn::{ImmediateKeys, NoLimitTracker, Table, Value, Vm};

const KEYS: i64 = 1000;

fn filled_table() -> Table {
    let mut table = Table::new();
    for key in 0..KEYS {
        table.set(&ImmediateKeys, Value::Int(key), Value::Int(key)).unwrap();
    }
    table
}

/// Inserts, looks up and deletes immediate keys directly on a table.
fn table_benchmark(c: &mut Criterion) {
    c.bench_function("table_insert_1000", |b| {
        b.iter(|| black_box(filled_table()));
    });

    let table = filled_table();
    c.bench_function("table_lookup_1000", |b| {
        b.iter(|| {
            let mut hits = 0;
            for key in 0..KEYS {
                if table.get(&ImmediateKeys, Value::Int(key)).unwrap().is_some() {
                    hits += 1;
                }
            }
            black_box(hits)
        });
    });

    c.bench_function("table_churn_1000", |b| {
        b.iter(|| {
            let mut table = filled_table();
            for key in (0..KEYS).step_by(2) {
                table.delete(&ImmediateKeys, Value::Int(key)).unwrap();
            }
            for key in KEYS..KEYS + KEYS / 2 {
                table.set(&ImmediateKeys, Value::Int(key), Value::None).unwrap();
            }
            black_box(table.len())
        });
    });
}

/// Same traffic through a VM dict, so string keys go through hashing and interning.
fn dict_benchmark(c: &mut Criterion) {
    let mut vm = Vm::new(NoLimitTracker);
    let keys: Vec<Value> = (0..KEYS)
        .map(|i| {
            let key = vm.new_str(&format!("key{i}")).unwrap();
            vm.push(key);
            key
        })
        .collect();

    c.bench_function("dict_set_get_1000", |b| {
        b.iter(|| {
            let dict = vm.new_dict().unwrap();
            vm.push(dict);
            for (i, &key) in keys.iter().enumerate() {
                vm.set_item(dict, key, Value::Int(i as i64)).unwrap();
            }
            let mut total = 0;
            for &key in &keys {
                total += vm.get_item(dict, key).unwrap().as_int().unwrap();
            }
            vm.pop();
            black_box(total)
        });
    });
}

criterion_group!(benches, table_benchmark, dict_benchmark);
criterion_main!(benches);
