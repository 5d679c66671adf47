//! The read/write split router.
//!
//! Per-session state machines sharing a read-only view of the server
//! roster: target resolution (`target`), backend selection (`select`), the
//! session command log (`sescmd`), reply assembly (`reply`), the statement
//! path (`engine`) and session lifecycle (`session`).

pub mod engine;
pub mod reply;
pub mod select;
pub mod sescmd;
pub mod session;
pub mod target;

pub use engine::{ClientRequest, RouteOutcome};
pub use session::{LoadDataState, RouterSession, TrxView};
pub use target::{resolve, RouteInput, RouteTarget};

#[cfg(test)]
mod scenarios {
    //! End-to-end scenarios for the router core, driven through classifier
    //! doubles and channel-backed backends. No sockets, no SQL parsing.

    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::backend::{BackendId, ReplyState, RouterBackend};
    use crate::classifier::testing::ScriptedClassifier;
    use crate::classifier::QueryType;
    use crate::config::{MasterFailureMode, RouterConfig};
    use crate::hint::Hint;
    use crate::monitor::{server_status, ServerInfo};
    use crate::protocol::{is_err_packet, ErrPacket, OkPacket, Packet};

    use super::*;

    const MASTER: u32 = server_status::RUNNING | server_status::MASTER;
    const SLAVE: u32 = server_status::RUNNING | server_status::SLAVE;

    struct Harness {
        session: RouterSession,
        taps: Vec<UnboundedReceiver<Packet>>,
    }

    impl Harness {
        fn new(
            config: RouterConfig,
            classifier: ScriptedClassifier,
            servers: &[(&str, u32)],
        ) -> Self {
            let mut backends = Vec::new();
            let mut taps = Vec::new();

            for (idx, (name, status)) in servers.iter().enumerate() {
                let server = Arc::new(ServerInfo::new(*name, "127.0.0.1:3306"));
                server.set_status(*status);
                let (backend, rx) = RouterBackend::for_test(BackendId(idx), server);
                backends.push(backend);
                taps.push(rx);
            }

            Self {
                session: RouterSession::for_test(config, Box::new(classifier), backends),
                taps,
            }
        }

        fn query(&mut self, sql: &str) -> RouteOutcome {
            self.query_with(sql, &[], TrxView::default())
        }

        fn query_with(&mut self, sql: &str, hints: &[Hint], trx: TrxView) -> RouteOutcome {
            let request = ClientRequest::with_hints(Packet::query(0, sql), hints.to_vec());
            self.session.route_stmt(&request, trx)
        }

        /// SQL strings received by a backend since the last call
        fn drain(&mut self, idx: usize) -> Vec<String> {
            let mut out = Vec::new();
            while let Ok(packet) = self.taps[idx].try_recv() {
                out.push(String::from_utf8_lossy(&packet.payload[1.min(packet.payload.len())..]).to_string());
            }
            out
        }

        fn reply_ok(&mut self, idx: usize) -> Vec<Packet> {
            let ok = OkPacket::new().encode(1, crate::protocol::capabilities::CLIENT_PROTOCOL_41);
            self.session.process_reply(BackendId(idx), ok)
        }

        /// Invariant: expected_responses equals the number of backends with
        /// an unfinished reply
        fn assert_response_invariant(&self) {
            let outstanding = (0..self.taps.len())
                .filter(|i| {
                    self.session.backend(BackendId(*i)).reply_state() != ReplyState::Done
                })
                .count() as u64;
            assert_eq!(self.session.expected_responses(), outstanding);
        }
    }

    fn sescmd_classifier() -> ScriptedClassifier {
        ScriptedClassifier::new()
            .on("SET autocommit=0", QueryType::SESSION_WRITE | QueryType::DISABLE_AUTOCOMMIT)
            .on("USE app", QueryType::SESSION_WRITE)
            .on("SELECT 1", QueryType::READ)
            .on("INSERT INTO t VALUES (1)", QueryType::WRITE)
    }

    // S1: a session write is broadcast; the first reply reaches the client,
    // the rest are merged silently.
    #[tokio::test]
    async fn test_s1_session_write_broadcast() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE), ("R2", SLAVE)],
        );

        assert!(matches!(
            h.query("SET autocommit=0"),
            RouteOutcome::Forwarded
        ));

        assert_eq!(h.session.sescmd_count(), 1);
        assert_eq!(h.session.expected_responses(), 3);
        h.assert_response_invariant();
        for idx in 0..3 {
            assert_eq!(h.drain(idx), vec!["SET autocommit=0".to_string()]);
        }

        // first reply (R1) goes to the client
        let emitted = h.reply_ok(1);
        assert_eq!(emitted.len(), 1);
        h.assert_response_invariant();

        // the duplicates are consumed silently
        assert!(h.reply_ok(2).is_empty());
        assert!(h.reply_ok(0).is_empty());

        assert_eq!(h.session.expected_responses(), 0);
        h.assert_response_invariant();
    }

    // S2: a named-server hint overrides the default replica choice and
    // falls back to any replica when the name is unusable.
    #[tokio::test]
    async fn test_s2_named_server_hint() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE), ("R2", SLAVE)],
        );

        let hints = [Hint::RouteToNamedServer("R2".to_string())];
        assert!(matches!(
            h.query_with("SELECT 1", &hints, TrxView::default()),
            RouteOutcome::Forwarded
        ));
        assert_eq!(h.drain(2), vec!["SELECT 1".to_string()]);
        assert!(h.drain(1).is_empty());
        h.reply_ok(2);

        // R2 gone: the same hint lands on any replica
        h.session.backend_mut(BackendId(2)).close();
        assert!(matches!(
            h.query_with("SELECT 1", &hints, TrxView::default()),
            RouteOutcome::Forwarded
        ));
        assert_eq!(h.drain(1), vec!["SELECT 1".to_string()]);
    }

    // S3: a replica that reconnects replays the whole log, in order,
    // before anything else reaches it.
    #[tokio::test]
    async fn test_s3_replica_replay_after_reconnect() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE)],
        );

        h.query("SET autocommit=0");
        h.reply_ok(1);
        h.reply_ok(0);
        h.query("USE app");
        h.reply_ok(1);
        h.reply_ok(0);
        h.drain(0);
        h.drain(1);

        // R1 drops out and comes back
        h.session.handle_backend_gone(BackendId(1), TrxView::default());
        assert!(!h.session.backend(BackendId(1)).in_use());

        h.taps[1] = h.session.backend_mut(BackendId(1)).rearm_for_test();
        assert!(h.session.on_backend_rejoined(BackendId(1)));

        // the replay queue covers the full log before any new statement
        assert_eq!(
            h.session.backend(BackendId(1)).replay_positions(),
            vec![0, 1]
        );

        // replay happens one command at a time, in log order
        assert_eq!(h.drain(1), vec!["SET autocommit=0".to_string()]);
        h.reply_ok(1);
        assert_eq!(h.drain(1), vec!["USE app".to_string()]);
        h.reply_ok(1);
        assert_eq!(h.session.backend(BackendId(1)).cursor(), 2);

        // caught up: reads may use it again
        h.query("SELECT 1");
        assert_eq!(h.drain(1), vec!["SELECT 1".to_string()]);
    }

    // S4: failover under error-on-write keeps the session alive; writes
    // get a synthetic read-only error, reads keep flowing to replicas.
    #[tokio::test]
    async fn test_s4_failover_error_on_write() {
        let config = RouterConfig {
            master_failure_mode: MasterFailureMode::ErrorOnWrite,
            ..RouterConfig::default()
        };
        let mut h = Harness::new(
            config,
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE)],
        );

        h.query("SELECT 1");
        assert_eq!(h.drain(1), vec!["SELECT 1".to_string()]);
        h.reply_ok(1);

        // primary disappears
        h.session.backend(BackendId(0)).server().set_status(0);
        let emitted = h.session.handle_failover();
        assert!(emitted.is_empty());
        assert_eq!(h.session.current_master(), None);

        // the write is answered with a synthetic read-only error
        match h.query("INSERT INTO t VALUES (1)") {
            RouteOutcome::Reply(packets) => {
                assert_eq!(packets.len(), 1);
                assert!(is_err_packet(&packets[0].payload));
                let err =
                    ErrPacket::parse(&packets[0].payload, h.session.backend(BackendId(0)).capabilities())
                        .unwrap();
                assert_eq!(err.error_code, 1792);
            }
            other => panic!("expected synthesized reply, got {other:?}"),
        }
        assert!(h.session.failure().is_none());

        // reads still work
        assert!(matches!(h.query("SELECT 1"), RouteOutcome::Forwarded));
        assert_eq!(h.drain(1), vec!["SELECT 1".to_string()]);
    }

    // S4 variant: fail-instantly terminates the session when the primary
    // set changes to empty.
    #[tokio::test]
    async fn test_failover_fail_instantly() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE)],
        );

        h.session.backend(BackendId(0)).server().set_status(0);
        h.session.handle_failover();
        assert!(h.session.failure().is_some());
    }

    // S5: crossing the history bound disables replay; a replica that fell
    // behind is out for the rest of the session.
    #[tokio::test]
    async fn test_s5_history_bound() {
        let config = RouterConfig {
            max_sescmd_history: 3,
            ..RouterConfig::default()
        };
        let classifier = ScriptedClassifier::new()
            .on("SET v=0", QueryType::SESSION_WRITE)
            .on("SET v=1", QueryType::SESSION_WRITE)
            .on("SET v=2", QueryType::SESSION_WRITE)
            .on("SET v=3", QueryType::SESSION_WRITE)
            .on("SELECT 1", QueryType::READ);
        let mut h = Harness::new(config, classifier, &[("P", MASTER), ("R1", SLAVE), ("R2", SLAVE)]);

        for i in 0..3 {
            h.query(&format!("SET v={i}"));
            for idx in 0..3 {
                h.reply_ok(idx);
            }
        }

        // R2 is lost before the fourth command
        h.session.handle_backend_gone(BackendId(2), TrxView::default());

        h.query("SET v=3");
        for idx in 0..2 {
            h.reply_ok(idx);
        }

        assert_eq!(h.session.sescmd_count(), 4);
        assert!(h.session.log.is_history_disabled());
        assert!(h.session.log.is_empty());

        // R2 cannot come back: the log it would need is gone
        h.taps[2] = h.session.backend_mut(BackendId(2)).rearm_for_test();
        assert!(!h.session.on_backend_rejoined(BackendId(2)));
        assert!(!h.session.backend(BackendId(2)).in_use());

        // reads keep to the consistent replica
        h.query("SELECT 1");
        assert_eq!(h.drain(1), vec!["SELECT 1".to_string()]);
        assert!(h.drain(2).is_empty());
    }

    // S6: LOAD DATA LOCAL INFILE suspends request/response framing until
    // the empty terminator packet.
    #[tokio::test]
    async fn test_s6_load_data_local_infile() {
        let classifier = ScriptedClassifier::new().on_op(
            "LOAD DATA LOCAL INFILE '/tmp/f' INTO TABLE t",
            QueryType::WRITE,
            crate::classifier::Operation::Load,
        );
        let mut h = Harness::new(
            RouterConfig::default(),
            classifier,
            &[("P", MASTER), ("R1", SLAVE)],
        );

        // the statement itself: INACTIVE -> START -> ACTIVE once forwarded
        assert!(matches!(
            h.query("LOAD DATA LOCAL INFILE '/tmp/f' INTO TABLE t"),
            RouteOutcome::Forwarded
        ));
        assert_eq!(h.session.load_data, LoadDataState::Active);
        assert_eq!(h.drain(0).len(), 1);

        // the server's file request streams back to the client
        let infile = Packet::new(1, Bytes::from_static(&[0xFB, b'/', b'f']));
        let emitted = h.session.process_reply(BackendId(0), infile);
        assert_eq!(emitted.len(), 1);

        // raw data packets flow to the primary with no response expected
        for chunk in [&b"csv,data,1"[..], &b"csv,data,2"[..]] {
            let request = ClientRequest::new(Packet::new(0, Bytes::copy_from_slice(chunk)));
            assert!(matches!(
                h.session.route_stmt(&request, TrxView::default()),
                RouteOutcome::Forwarded
            ));
        }
        assert_eq!(h.session.load_data, LoadDataState::Active);
        assert!(h.session.load_data_sent > 0);
        assert_eq!(h.drain(0).len(), 2);
        // nothing outstanding while the client streams the file
        assert_eq!(h.session.expected_responses(), 0);

        // the empty terminator expects the final OK
        let terminator = ClientRequest::new(Packet::new(0, Bytes::new()));
        assert!(matches!(
            h.session.route_stmt(&terminator, TrxView::default()),
            RouteOutcome::Forwarded
        ));
        assert_eq!(h.session.load_data, LoadDataState::End);

        let emitted = h.reply_ok(0);
        assert_eq!(emitted.len(), 1);
        assert_eq!(h.session.load_data, LoadDataState::Inactive);
        h.assert_response_invariant();
    }

    // Property 5: every statement of an open read-only transaction goes to
    // the pinned replica until the transaction ends.
    #[tokio::test]
    async fn test_read_only_transaction_pins_replica() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE), ("R2", SLAVE)],
        );

        let active = TrxView {
            active: true,
            read_only: true,
            ending: false,
        };

        h.query_with("SELECT 1", &[], active);
        h.reply_ok(1);
        let pinned = if h.drain(1).is_empty() { 2 } else { 1 };

        // make the other replica look cheaper; the pin must still win
        for _ in 0..5 {
            h.session
                .backend(BackendId(pinned))
                .server()
                .incr_current_ops();
        }

        h.query_with("SELECT 1", &[], active);
        h.reply_ok(pinned);
        assert_eq!(h.drain(pinned), vec!["SELECT 1".to_string()]);

        // the COMMIT of the read-only transaction releases the pin
        let ending = TrxView {
            active: true,
            read_only: true,
            ending: true,
        };
        h.query_with("SELECT 1", &[], ending);
        h.reply_ok(pinned);
        h.drain(pinned);

        // next read is free to pick the cheaper replica
        h.query("SELECT 1");
        let other = if pinned == 1 { 2 } else { 1 };
        assert_eq!(h.drain(other), vec!["SELECT 1".to_string()]);
    }

    // A multi-statement packet pins routing to the primary.
    #[tokio::test]
    async fn test_multi_statement_pins_master() {
        let classifier = ScriptedClassifier::new()
            .on("SELECT 1; SELECT 2", QueryType::READ)
            .on("SELECT 1", QueryType::READ);
        let mut h = Harness::new(
            RouterConfig {
                strict_multi_stmt: true,
                ..RouterConfig::default()
            },
            classifier,
            &[("P", MASTER), ("R1", SLAVE)],
        );

        h.query("SELECT 1; SELECT 2");
        assert_eq!(h.drain(0).len(), 1);
        assert!(h.drain(1).is_empty());
        h.reply_ok(0);

        // strict mode: the pin persists for plain reads too
        h.query("SELECT 1");
        assert_eq!(h.drain(0), vec!["SELECT 1".to_string()]);
    }

    // Divergent session command replies disqualify the backend.
    #[tokio::test]
    async fn test_sescmd_divergence_drops_backend() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE), ("R2", SLAVE)],
        );

        h.query("SET autocommit=0");

        // P answers OK and its reply is stored
        let emitted = h.reply_ok(0);
        assert_eq!(emitted.len(), 1);

        // R1 answers with an error at the same position
        let err = ErrPacket::new(1193, "HY000", "Unknown system variable")
            .encode(1, crate::protocol::capabilities::CLIENT_PROTOCOL_41);
        let emitted = h.session.process_reply(BackendId(1), err);
        assert!(emitted.is_empty());
        assert!(!h.session.backend(BackendId(1)).in_use());

        // R2 agreeing with P stays in
        assert!(h.reply_ok(2).is_empty());
        assert!(h.session.backend(BackendId(2)).in_use());
    }

    // A replica dying mid-read triggers exactly one retry on another one.
    #[tokio::test]
    async fn test_read_retry_on_replica_loss() {
        let mut h = Harness::new(
            RouterConfig::default(),
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE), ("R2", SLAVE)],
        );

        h.query("SELECT 1");
        let reader = if h.drain(1).is_empty() { 2 } else { 1 };
        let other = if reader == 1 { 2 } else { 1 };

        // the replica dies before replying: the read moves, the client
        // sees nothing
        let emitted = h
            .session
            .handle_backend_gone(BackendId(reader), TrxView::default());
        assert!(emitted.is_empty());
        assert_eq!(h.drain(other), vec!["SELECT 1".to_string()]);

        // the second replica dying too surfaces the error
        let emitted = h
            .session
            .handle_backend_gone(BackendId(other), TrxView::default());
        assert_eq!(emitted.len(), 1);
        assert!(is_err_packet(&emitted[0].payload));
    }

    // Writes target the new primary after failover with no client-visible
    // reconnection.
    #[tokio::test]
    async fn test_failover_promotes_new_primary() {
        let config = RouterConfig {
            master_failure_mode: MasterFailureMode::ErrorOnWrite,
            ..RouterConfig::default()
        };
        let mut h = Harness::new(
            config,
            sescmd_classifier(),
            &[("P", MASTER), ("R1", SLAVE)],
        );

        h.query("INSERT INTO t VALUES (1)");
        assert_eq!(h.drain(0).len(), 1);
        h.reply_ok(0);

        // R1 is promoted, P demoted
        h.session.backend(BackendId(0)).server().set_status(SLAVE);
        h.session.backend(BackendId(1)).server().set_status(MASTER);
        h.session.handle_failover();
        assert_eq!(h.session.current_master(), Some(BackendId(1)));

        h.query("INSERT INTO t VALUES (1)");
        assert_eq!(h.drain(1).len(), 1);
        assert!(h.drain(0).is_empty());
    }
}
