//! Request-level tests: parameter gate, version floors, operator secret and
//! the text replies of a full task lifecycle.

use chaffin_coordinator::config::{ServerConfig, ThrottleConfig};
use chaffin_coordinator::coordinator::Coordinator;
use chaffin_coordinator::db::Database;
use std::collections::HashMap;
use std::sync::Arc;

const SECRET: &str = "sesame";
const IP: &str = "192.168.1.20";

fn setup(server: ServerConfig) -> Coordinator {
    let db = Arc::new(Database::open_in_memory().expect("Failed to create in-memory database"));
    Coordinator::new(db, server, ThrottleConfig::default()).expect("Failed to build coordinator")
}

fn setup_default() -> Coordinator {
    setup(ServerConfig {
        operator_secret: Some(SECRET.to_string()),
        ..ServerConfig::default()
    })
}

fn call(coordinator: &Coordinator, pairs: &[(&str, &str)]) -> String {
    let params: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    coordinator.handle(&params, IP)
}

/// Pull `key: value` out of a reply.
fn field<'a>(reply: &'a str, key: &str) -> &'a str {
    reply
        .lines()
        .find_map(|line| line.strip_prefix(&format!("{}: ", key)))
        .unwrap_or_else(|| panic!("no {} in reply {:?}", key, reply))
}

fn register(coordinator: &Coordinator) -> String {
    let reply = call(
        coordinator,
        &[
            ("action", "register"),
            ("version", "13"),
            ("programInstance", "1"),
            ("team", "Team Blue"),
        ],
    );
    assert!(reply.starts_with("Registered\n"), "{}", reply);
    field(&reply, "Client id").to_string()
}

mod gate_tests {
    use super::*;

    #[test]
    fn hello_needs_nothing_else() {
        let coordinator = setup_default();
        assert_eq!(call(&coordinator, &[("action", "hello")]), "Hello world.\n");
    }

    #[test]
    fn unknown_action_is_named() {
        let coordinator = setup_default();
        assert_eq!(
            call(&coordinator, &[("action", "dance"), ("version", "13")]),
            "Error: Unrecognised action dance\n"
        );
    }

    #[test]
    fn malformed_or_missing_parameters_are_invalid_queries() {
        let coordinator = setup_default();
        let cases: &[&[(&str, &str)]] = &[
            &[],
            &[("action", "checkIn"), ("version", "13"), ("id", "1")],
            &[("action", "checkIn"), ("version", "13"), ("id", "1;"), ("access", "2")],
            &[("action", "register"), ("version", "13"), ("programInstance", "1"), ("team", "<b>")],
        ];
        for params in cases {
            assert_eq!(call(&coordinator, params), "Error: Invalid query\n");
        }
    }

    #[test]
    fn old_clients_are_told_to_upgrade() {
        let coordinator = setup_default();
        let reply = call(
            &coordinator,
            &[("action", "register"), ("version", "12"), ("programInstance", "1")],
        );
        assert!(reply.starts_with("The version of DistributedChaffinMethod you are using has been superseded.\n"));
        assert!(reply.contains("Please download version 13 or later"));
    }

    #[test]
    fn soft_floor_unregisters_clients_asking_for_work() {
        let coordinator = setup(ServerConfig {
            operator_secret: Some(SECRET.to_string()),
            version_required: 12,
            version_for_new_tasks: 13,
            ..ServerConfig::default()
        });
        let client_id = register(&coordinator);

        // Old clients may still check in on work they hold
        let reply = call(
            &coordinator,
            &[("action", "checkIn"), ("version", "12"), ("id", "1"), ("access", "1")],
        );
        assert!(reply.starts_with("Cancelled: "), "{}", reply);

        let reply = call(
            &coordinator,
            &[
                ("action", "getTask"),
                ("version", "12"),
                ("clientID", &client_id),
                ("programInstance", "1"),
                ("IP", IP),
            ],
        );
        assert!(reply.contains("Please download version 13 or later"));
        let id: i64 = client_id.parse().unwrap();
        assert!(coordinator.db().get_worker(id).unwrap().is_none());
    }

    #[test]
    fn operator_actions_need_the_secret() {
        let coordinator = setup_default();
        let create = [
            ("action", "createTask"),
            ("n", "4"),
            ("w", "5"),
            ("str", "1234"),
            ("pte", "19"),
        ];
        assert_eq!(call(&coordinator, &create), "Error: Not authorized\n");

        let mut wrong = create.to_vec();
        wrong.push(("pwd", "guess"));
        assert_eq!(call(&coordinator, &wrong), "Error: Not authorized\n");

        let mut right = create.to_vec();
        right.push(("pwd", SECRET));
        assert_eq!(call(&coordinator, &right), "Task id: 1\n");
        assert_eq!(
            call(&coordinator, &right),
            "Task id: 1 already existed with those properties\n"
        );
    }

    #[test]
    fn operator_actions_disabled_without_secret() {
        let coordinator = setup(ServerConfig::default());
        let reply = call(
            &coordinator,
            &[("action", "cancelStalledTasks"), ("maxMins", "30"), ("pwd", "")],
        );
        assert_eq!(reply, "Error: Not authorized\n");
    }

    #[test]
    fn stall_thresholds_must_be_positive() {
        let coordinator = setup_default();
        for (action, minutes) in [
            ("cancelStalledTasks", "0"),
            ("cancelStalledClients", "0"),
            ("cancelStalledTasks", "99999999999999999999"),
        ] {
            let reply = call(
                &coordinator,
                &[("action", action), ("pwd", SECRET), ("maxMins", minutes)],
            );
            assert_eq!(reply, "Error: Invalid query\n");
        }
        assert_eq!(
            call(
                &coordinator,
                &[("action", "cancelStalledClients"), ("pwd", SECRET), ("maxMins", "153722867280912930")]
            ),
            "Cancelled 0 clients\n"
        );
    }

    #[test]
    fn witness_string_checks_alphabet_size() {
        let coordinator = setup_default();
        let reply = call(
            &coordinator,
            &[("action", "witnessString"), ("version", "13"), ("n", "12"), ("w", "0"), ("str", "1")],
        );
        assert_eq!(reply, "Error: Invalid query\n");
    }

    #[test]
    fn registry_capacity_is_reported() {
        let coordinator = setup(ServerConfig {
            max_workers: 1,
            ..ServerConfig::default()
        });
        register(&coordinator);
        let reply = call(
            &coordinator,
            &[("action", "register"), ("version", "13"), ("programInstance", "2")],
        );
        assert!(reply.contains("server is at capacity right now (1 out of 1)"), "{}", reply);
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn register_reports_connection_address() {
        let coordinator = setup_default();
        let reply = call(
            &coordinator,
            &[("action", "register"), ("version", "13"), ("programInstance", "7")],
        );
        assert_eq!(field(&reply, "IP"), IP);
        assert_eq!(field(&reply, "programInstance"), "7");
        assert_eq!(field(&reply, "team name"), "anonymous");
    }

    #[test]
    fn full_task_lifecycle() {
        let coordinator = setup_default();
        call(
            &coordinator,
            &[
                ("action", "createTask"),
                ("pwd", SECRET),
                ("n", "4"),
                ("w", "5"),
                ("str", "1234"),
                ("pte", "19"),
            ],
        );
        let client_id = register(&coordinator);
        let worker = [
            ("clientID", client_id.as_str()),
            ("programInstance", "1"),
            ("IP", IP),
            ("version", "13"),
        ];

        let mut get_task = worker.to_vec();
        get_task.push(("action", "getTask"));
        let offer = call(&coordinator, &get_task);
        assert_eq!(field(&offer, "Task id"), "1");
        assert_eq!(field(&offer, "n"), "4");
        assert_eq!(field(&offer, "pte"), "19");
        assert_eq!(field(&offer, "branchOrder"), "0000");
        assert_eq!(field(&offer, "timeBetweenServerCheckins"), "180");
        let access = field(&offer, "Access code").to_string();

        let reply = call(
            &coordinator,
            &[("action", "checkIn"), ("version", "13"), ("id", "1"), ("access", &access)],
        );
        assert_eq!(reply, "OK\n");

        let reply = call(
            &coordinator,
            &[
                ("action", "splitTask"),
                ("version", "13"),
                ("id", "1"),
                ("access", &access),
                ("newPrefix", "12341"),
                ("branchOrder", "00001"),
            ],
        );
        assert_eq!(reply, "OK\n");

        let reply = call(
            &coordinator,
            &[
                ("action", "finishTask"),
                ("version", "13"),
                ("id", "1"),
                ("access", &access),
                ("pro", "21"),
                ("str", "1234123142312431213421324132"),
                ("team", "Team Blue"),
                ("nodeCount", "5000"),
            ],
        );
        assert_eq!(reply, "OK\n");

        // The promoted child is next, with the target raised to the new record
        let offer = call(&coordinator, &get_task);
        assert_eq!(field(&offer, "Task id"), "2");
        assert_eq!(field(&offer, "str"), "12341");
        assert_eq!(field(&offer, "pte"), "20");

        let access = field(&offer, "Access code").to_string();
        let reply = call(
            &coordinator,
            &[
                ("action", "relinquishTask"),
                ("version", "13"),
                ("id", "2"),
                ("access", &access),
                ("clientID", &client_id),
            ],
        );
        assert_eq!(reply, "Relinquished task\n");

        let mut unregister = worker.to_vec();
        unregister.push(("action", "unregister"));
        assert_eq!(call(&coordinator, &unregister), "OK, client record deleted\n");

        let stats = coordinator.db().get_stats().unwrap();
        assert_eq!(stats.finished_tasks, 1);
        assert_eq!(stats.node_count, 5000);
        assert_eq!(stats.teams[0].team, "Team Blue");
    }

    #[test]
    fn witness_string_updates_ledger() {
        let coordinator = setup_default();
        let reply = call(
            &coordinator,
            &[
                ("action", "witnessString"),
                ("version", "13"),
                ("n", "4"),
                ("w", "6"),
                ("str", "123412314231243121342132413214321"),
            ],
        );
        assert_eq!(reply, "Valid string with 24 permutations\n(4, 6, 24)\n");
        assert_eq!(coordinator.db().superperm_count(4).unwrap(), 1);
    }

    #[test]
    fn operator_sweep_and_reaper_replies() {
        let coordinator = setup_default();
        assert_eq!(
            call(&coordinator, &[("action", "maybeFinishedAllTasks"), ("pwd", SECRET)]),
            "Error: finished_tasks table is empty\n"
        );
        assert_eq!(
            call(
                &coordinator,
                &[("action", "cancelStalledTasks"), ("pwd", SECRET), ("maxMins", "30")]
            ),
            "Cancelled 0 tasks\n"
        );
        assert_eq!(
            call(
                &coordinator,
                &[("action", "cancelStalledClients"), ("pwd", SECRET), ("maxMins", "60")]
            ),
            "Cancelled 0 clients\n"
        );
    }

    #[test]
    fn shedding_everything_answers_no_tasks() {
        let coordinator = setup_default();
        coordinator.throttle_handle().store(Arc::new(ThrottleConfig {
            one_in_x: 1,
            client_checkin_secs: 0,
            ..ThrottleConfig::default()
        }));
        let client_id = register(&coordinator);
        let reply = call(
            &coordinator,
            &[
                ("action", "getTask"),
                ("version", "13"),
                ("clientID", &client_id),
                ("programInstance", "1"),
                ("IP", IP),
            ],
        );
        assert_eq!(reply, "No tasks\n");
    }
}
