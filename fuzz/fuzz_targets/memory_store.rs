// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use crund::{
    attr_values, Backend, Column, Entity, MemoryStore, Predicate, Sign, StatementSpec, StoreError,
};
use libfuzzer_sys::fuzz_target;
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Arbitrary, Debug)]
enum Methods {
    Insert(u8),
    Update(u8),
    Delete(u8),
    Fetch(u8),
    FetchMany(Vec<u8>),
    Rollback,
    Commit,
}

/// Drives the memory store against a `BTreeMap` of committed cint values
/// plus one of pending writes.
fuzz_target!(|methods: Vec<Methods>| {
    let mut store = MemoryStore::new(false);
    let scalars = Column::SCALARS.to_vec();
    let insert = store
        .prepare(&StatementSpec::Insert {
            entity: Entity::A,
            columns: scalars.clone(),
        })
        .unwrap();
    let update = store
        .prepare(&StatementSpec::Update {
            entity: Entity::A,
            columns: scalars.clone(),
        })
        .unwrap();
    let delete = store
        .prepare(&StatementSpec::Delete { entity: Entity::A })
        .unwrap();
    let fetch = store
        .prepare(&StatementSpec::Fetch {
            entity: Entity::A,
            columns: scalars,
            predicate: Predicate::KeyIn,
        })
        .unwrap();

    let mut committed = BTreeMap::<i32, i32>::new();
    let mut pending = committed.clone();
    let mut tx = store.begin().unwrap();

    for m in methods {
        match m {
            Methods::Insert(k) => {
                let key = i32::from(k);
                let result = store.issue_one(&mut tx, &insert, key, &attr_values(key, Sign::Positive));
                if pending.contains_key(&key) {
                    assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
                } else {
                    assert_eq!(result.unwrap(), 1);
                    pending.insert(key, key);
                }
            }
            Methods::Update(k) => {
                let key = i32::from(k);
                let affected = store
                    .issue_one(&mut tx, &update, key, &attr_values(key, Sign::Negative))
                    .unwrap();
                match pending.get_mut(&key) {
                    Some(v) => {
                        assert_eq!(affected, 1);
                        *v = -key;
                    }
                    None => assert_eq!(affected, 0),
                }
            }
            Methods::Delete(k) => {
                let key = i32::from(k);
                let affected = store.issue_one(&mut tx, &delete, key, &[]).unwrap();
                assert_eq!(affected, u64::from(pending.remove(&key).is_some()));
            }
            Methods::Fetch(k) => {
                let key = i32::from(k);
                let row = store.fetch_one(&mut tx, &fetch, key).unwrap();
                assert_eq!(row.and_then(|r| r.cint), pending.get(&key).copied());
            }
            Methods::FetchMany(keys) => {
                let mut keys: Vec<i32> = keys.into_iter().map(i32::from).collect();
                keys.sort_unstable();
                keys.dedup();
                let mut rows = store.fetch_many(&mut tx, &fetch, &keys).unwrap();
                rows.sort_by_key(|r| r.id);
                let expected: Vec<(i32, i32)> = keys
                    .iter()
                    .filter_map(|k| pending.get(k).map(|v| (*k, *v)))
                    .collect();
                let actual: Vec<(i32, i32)> = rows
                    .iter()
                    .map(|r| (r.id, r.cint.unwrap_or(i32::MIN)))
                    .collect();
                assert_eq!(actual, expected);
            }
            Methods::Rollback => {
                store.rollback(&mut tx).unwrap();
                store.close(tx);
                pending = committed.clone();
                tx = store.begin().unwrap();
            }
            Methods::Commit => {
                store.commit(&mut tx).unwrap();
                store.close(tx);
                committed = pending.clone();
                tx = store.begin().unwrap();
            }
        }
    }

    store.close(tx);
    for statement in [insert, update, delete, fetch] {
        store.release(statement).unwrap();
    }
    assert_eq!(store.len(Entity::A), committed.len());
});
