// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::mock::{set_next_faults, Faults, FaultyStore};
use crate::metric::Counter;
use crate::{run_benchmark, Config, ConfigError, MemoryStore, RunError, XMode};

fn small_config() -> Config {
    let mut config = Config::default();
    config
        .n_ops(2, 20)
        .n_ops_scale(10)
        .n_runs(2)
        .warmup_runs(1)
        .max_varbinary_bytes(10)
        .max_varchar_chars(10);
    config
}

#[test]
fn full_run_against_memory_store() {
    let config = small_config();
    let report = run_benchmark::<MemoryStore>(&config).unwrap();

    assert_eq!(report.backend, "memory");
    assert_eq!(report.rounds.len(), 2);
    let per_mode = 8 + 6 + 6 + 5 + 2 + 2 + 2;
    for (round, n_ops) in report.rounds.iter().zip([2usize, 20]) {
        assert_eq!(round.n_ops, n_ops);
        assert_eq!(round.timers.timers().len(), per_mode * 3);
        assert!(round.timers.timers().iter().all(|t| t.runs().len() == 2));
        assert_eq!(round.run_sums().len(), 2);

        // two measured runs, one unit of work per key each
        let insert = round
            .counters
            .iter()
            .find(|c| c.operation == "A_insAttr_indy")
            .unwrap();
        assert_eq!(insert.counters.get(Counter::Begin), 2 * n_ops as u64);
        assert_eq!(insert.counters.get(Counter::IssueOne), 2 * n_ops as u64);

        let bulk = round
            .counters
            .iter()
            .find(|c| c.operation == "B_getAttr_wherein_bulk")
            .unwrap();
        assert_eq!(bulk.counters.get(Counter::FetchMany), 2);
        assert_eq!(bulk.counters.get(Counter::Begin), 2);
    }
}

#[test]
fn renewing_connections_and_operations() {
    let mut config = small_config();
    config.renew_connection(true).modes(vec![XMode::Bulk]);
    assert!(run_benchmark::<MemoryStore>(&config).is_ok());

    let mut config = small_config();
    config.renew_operations(true).modes(vec![XMode::Each]);
    assert!(run_benchmark::<MemoryStore>(&config).is_ok());
}

#[test]
fn failing_operation_stops_the_run() {
    set_next_faults(Faults {
        corrupt_cint: Some(1),
        ..Faults::default()
    });
    let mut config = small_config();
    config.modes(vec![XMode::Each]);
    match run_benchmark::<FaultyStore>(&config) {
        Err(RunError::Exec(e)) => {
            assert_eq!(e.operation(), "A_getAttr_each");
            assert_eq!(e.key(), Some(1));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let mut config = small_config();
    config.n_runs(0);
    assert!(matches!(
        run_benchmark::<MemoryStore>(&config),
        Err(RunError::Config(ConfigError::RunCount(_)))
    ));
}

#[test]
fn reports_are_written_as_json_and_log() {
    let mut config = small_config();
    config.n_ops(3, 3).n_runs(3).modes(vec![XMode::Indy]);
    let report = run_benchmark::<MemoryStore>(&config).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let dir = report.write(tmp.path()).unwrap();
    assert!(dir.starts_with(tmp.path()));

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("memory.json")).unwrap()).unwrap();
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["rounds"][0]["n_ops"], 3);
    assert_eq!(json["rounds"][0]["timers"][0]["name"], "A_insAttr_indy");
    assert_eq!(
        json["rounds"][0]["timers"][0]["runs_us"]
            .as_array()
            .unwrap()
            .len(),
        3
    );

    let log = std::fs::read_to_string(dir.join("memory.log")).unwrap();
    let lines: Vec<_> = log.lines().collect();
    assert_eq!(lines[0], "[memory] n_ops=3");
    assert_eq!(lines[1], "operation\trun1\trun2\trun3");
    assert!(lines[2].starts_with("A_insAttr_indy\t"));
    assert!(lines.iter().any(|l| l.starts_with("sum\t")));
}
