//! Unit tests for client queries and monitor bookkeeping
//!
//! Engines register with real hearts; task traffic is published on the
//! hub's in-process monitor address.

use std::time::{Duration, Instant};

use bytes::Bytes;
use parhub_core::coordinator::factory::INPROC_MONITOR;
use parhub_core::coordinator::ledger::stranded_content;
use parhub_core::coordinator::HubServer;
use parhub_core::protocol::messages::{
    self, ConnectionReply, DbQuery, DbReply, HistoryReply, LoadReply, LoadRequest, PurgeReply,
    PurgeRequest, QueueStatusReply, QueueStatusRequest, Registration, RegistrationAck,
    ResubmitReply, ResubmitRequest, ResultReply, ResultRequest, ShutdownAck, TaskRequestHeader,
    TaskResultHeader,
};
use parhub_core::protocol::{
    notification, Lane, Message, PubSocket, QueryKind, RouterSocket, SubSocket, TaskStatus,
};
use parhub_core::worker::{ClientConfig, Heart, HeartHandle, HubClient};
use parhub_core::{Context, EngineId, HubError, HubFactory};
use serde::de::DeserializeOwned;
use serde::Serialize;

struct Cluster {
    ctx: Context,
    server: HubServer,
    client: HubClient,
    monitor: PubSocket,
    hearts: Vec<HeartHandle>,
}

impl Cluster {
    /// A hub with `engines` registered engines `q0..qN` whose hearts are `h0..hN`
    fn start(engines: usize, registration_timeout: Duration) -> Self {
        let ctx = Context::new();
        let mut server = HubFactory::new(9000)
            .heartbeat_interval(Duration::from_millis(50))
            .registration_timeout(registration_timeout)
            .shutdown_delay(Duration::from_millis(50))
            .build(&ctx)
            .unwrap();
        let client = HubClient::connect(
            &ctx,
            ClientConfig {
                hub_addr: server.client_info().registration.clone(),
                identity: "client".into(),
                request_timeout: Duration::from_millis(500),
            },
        );
        let monitor = PubSocket::connect(&ctx, INPROC_MONITOR);

        let hb = server.engine_info().heartbeat.clone();
        let mut hearts = Vec::new();
        for n in 0..engines {
            hearts.push(Heart::new(&hb[0], &hb[1], &format!("h{}", n)).spawn(&ctx).unwrap());
            client
                .send_request(
                    QueryKind::Registration,
                    &Registration {
                        heartbeat: format!("h{}", n),
                        queue: format!("q{}", n),
                        registration: format!("engine-{}", n),
                        services: Vec::new(),
                    },
                )
                .unwrap();
        }
        server.run_for(Duration::from_millis(250));
        for _ in 0..engines {
            client
                .recv_reply::<RegistrationAck>(QueryKind::Registration)
                .unwrap();
        }
        assert_eq!(server.hub().num_engines(), engines);

        Self {
            ctx,
            server,
            client,
            monitor,
            hearts,
        }
    }

    fn pump(&mut self) {
        self.server.run_for(Duration::from_millis(20));
    }

    fn ask<T: Serialize, R: DeserializeOwned>(
        &mut self,
        kind: QueryKind,
        payload: &T,
    ) -> parhub_core::Result<(R, Vec<Bytes>)> {
        self.client.send_request(kind, payload).unwrap();
        self.pump();
        self.client.recv_reply(kind)
    }

    fn publish(&mut self, msg: Message) {
        assert_eq!(self.monitor.send(msg), 1);
    }

    fn submit(&mut self, msg_id: &str, lane: Lane, engine: Option<&str>) {
        let header = TaskRequestHeader {
            msg_id: msg_id.into(),
            client: "client".into(),
            engine: engine.map(str::to_string),
            submitted: None,
        };
        let body = Bytes::from(format!("body of {}", msg_id));
        self.publish(messages::task_request(lane, &header, body).unwrap());
    }

    fn finish(&mut self, msg_id: &str, lane: Lane, engine: &str, result: &str) {
        let header = TaskResultHeader {
            msg_id: msg_id.into(),
            engine: Some(engine.into()),
            started: None,
            completed: None,
        };
        self.publish(messages::task_result(lane, &header, Bytes::from(result.to_string())).unwrap());
    }

    fn results(&mut self, ids: &[&str], status_only: bool) -> parhub_core::Result<(ResultReply, Vec<Bytes>)> {
        let request = ResultRequest {
            msg_ids: ids.iter().map(|s| s.to_string()).collect(),
            status_only,
        };
        self.ask(QueryKind::Results, &request)
    }
}

fn remote_ename<T: std::fmt::Debug>(result: parhub_core::Result<T>) -> String {
    match result {
        Err(HubError::Remote { ename, .. }) => ename,
        other => panic!("expected an error reply, got {:?}", other),
    }
}

#[test]
fn test_load_with_unknown_engine_fails_whole_request() {
    let mut cluster = Cluster::start(1, Duration::from_secs(2));

    let request = LoadRequest {
        targets: Some(vec![EngineId(0), EngineId(1)]),
    };
    let reply = cluster.ask::<_, LoadReply>(QueryKind::Load, &request);
    assert_eq!(remote_ename(reply), "UnknownEngine");

    let (load, _) = cluster
        .ask::<_, LoadReply>(QueryKind::Load, &LoadRequest::default())
        .unwrap();
    assert_eq!(load.len(), 1);
    assert_eq!(load[&EngineId(0)].queue, 0);
}

#[test]
fn test_load_counts_outstanding_tasks_per_lane() {
    let mut cluster = Cluster::start(2, Duration::from_secs(2));
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Scheduled, Some("q0"));
    cluster.submit("t3", Lane::Scheduled, None);
    cluster.pump();
    cluster.publish(messages::task_destination("t3", "q1").unwrap());
    cluster.finish("t1", Lane::Immediate, "q0", "ok");
    cluster.pump();

    let (load, _) = cluster
        .ask::<_, LoadReply>(QueryKind::Load, &LoadRequest::default())
        .unwrap();
    assert_eq!((load[&EngineId(0)].queue, load[&EngineId(0)].tasks), (0, 1));
    assert_eq!((load[&EngineId(1)].queue, load[&EngineId(1)].tasks), (0, 1));
}

#[test]
fn test_purge_all_then_results_is_unknown() {
    let mut cluster = Cluster::start(1, Duration::from_secs(2));
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.pump();
    cluster.finish("t1", Lane::Immediate, "q0", "42");
    cluster.pump();
    assert!(cluster.results(&["t1"], false).is_ok());

    let (purged, _) = cluster
        .ask::<_, PurgeReply>(
            QueryKind::Purge,
            &PurgeRequest {
                all: true,
                ..PurgeRequest::default()
            },
        )
        .unwrap();
    assert_eq!(purged.purged, 1);

    match cluster.results(&["t1"], false) {
        Err(HubError::Remote { ename, reason }) => {
            assert_eq!(ename, "UnknownTask");
            assert!(reason.contains("unknown message id"));
        }
        other => panic!("stale result returned: {:?}", other),
    }
}

#[test]
fn test_results_split_pending_and_completed() {
    let mut cluster = Cluster::start(1, Duration::from_secs(2));
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Immediate, Some("q0"));
    cluster.submit("t3", Lane::Scheduled, Some("q0"));
    cluster.pump();
    cluster.finish("t1", Lane::Immediate, "q0", "r1");
    cluster.finish("t3", Lane::Scheduled, "q0", "r3");
    cluster.pump();

    let (reply, frames) = cluster.results(&["t3", "t2", "t1"], false).unwrap();
    assert_eq!(reply.pending, vec!["t2"]);
    assert_eq!(reply.completed, vec!["t3", "t1"]);
    assert_eq!(frames, vec![Bytes::from("r3"), Bytes::from("r1")]);
    assert_eq!(reply.results["t1"].status, TaskStatus::Completed);
    assert_eq!(reply.results["t2"].engine, Some(EngineId(0)));

    let (_, frames) = cluster.results(&["t1"], true).unwrap();
    assert!(frames.is_empty());

    assert_eq!(remote_ename(cluster.results(&["t1", "nope"], false)), "UnknownTask");
}

#[test]
fn test_queue_status_reports_unassigned() {
    let mut cluster = Cluster::start(1, Duration::from_secs(2));
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Scheduled, None);
    cluster.submit("t3", Lane::Immediate, Some("q0"));
    cluster.pump();
    cluster.finish("t3", Lane::Immediate, "q0", "done");
    cluster.pump();

    let request = QueueStatusRequest {
        targets: None,
        verbose: true,
    };
    let (status, _) = cluster
        .ask::<_, QueueStatusReply>(QueryKind::QueueStatus, &request)
        .unwrap();
    let engine = &status.engines[&EngineId(0)];
    assert_eq!((engine.queue, engine.tasks, engine.completed), (1, 0, 1));
    assert_eq!(engine.queue_ids.as_deref(), Some(&["t1".to_string()][..]));
    assert_eq!(engine.completed_ids.as_deref(), Some(&["t3".to_string()][..]));
    assert_eq!(status.unassigned, vec!["t2"]);

    let (terse, _) = cluster
        .ask::<_, QueueStatusReply>(QueryKind::QueueStatus, &QueueStatusRequest::default())
        .unwrap();
    assert!(terse.engines[&EngineId(0)].queue_ids.is_none());
}

#[test]
fn test_purge_refuses_pending_tasks() {
    let mut cluster = Cluster::start(1, Duration::from_secs(2));
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Immediate, Some("q0"));
    cluster.pump();
    cluster.finish("t1", Lane::Immediate, "q0", "ok");
    cluster.pump();

    let request = PurgeRequest {
        msg_ids: vec!["t1".into(), "t2".into()],
        ..PurgeRequest::default()
    };
    assert_eq!(
        remote_ename(cluster.ask::<_, PurgeReply>(QueryKind::Purge, &request)),
        "TaskPending"
    );
    // nothing was evicted
    assert!(cluster.results(&["t1"], true).is_ok());

    let by_engine = PurgeRequest {
        engine_ids: vec![EngineId(0)],
        ..PurgeRequest::default()
    };
    let (purged, _) = cluster
        .ask::<_, PurgeReply>(QueryKind::Purge, &by_engine)
        .unwrap();
    assert_eq!(purged.purged, 1);
    assert_eq!(cluster.server.hub().ledger().len(), 1);
}

#[test]
fn test_history_and_db_query() {
    let mut cluster = Cluster::start(2, Duration::from_secs(2));
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Scheduled, Some("q1"));
    cluster.submit("t3", Lane::Immediate, Some("q1"));
    cluster.pump();
    cluster.finish("t3", Lane::Immediate, "q1", "ok");
    cluster.publish(messages::iopub("t3", "stdout", "hello").unwrap());
    cluster.pump();

    let (history, _) = cluster
        .ask::<_, HistoryReply>(QueryKind::History, &())
        .unwrap();
    assert_eq!(history.history, vec!["t1", "t2", "t3"]);

    let filter = DbQuery {
        engine: Some(EngineId(1)),
        status: Some(TaskStatus::Pending),
        ..DbQuery::default()
    };
    let (db, _) = cluster.ask::<_, DbReply>(QueryKind::Db, &filter).unwrap();
    let ids: Vec<&str> = db.records.iter().map(|r| r.msg_id.as_str()).collect();
    assert_eq!(ids, vec!["t2"]);

    let outputs = &cluster.server.hub().ledger().get("t3").unwrap().outputs;
    assert_eq!(outputs, &vec![("stdout".to_string(), "hello".to_string())]);
}

#[test]
fn test_resubmit_sends_original_body() {
    let mut cluster = Cluster::start(1, Duration::from_secs(2));
    let scheduler = RouterSocket::bind(&cluster.ctx, &cluster.server.client_info().task).unwrap();
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Immediate, Some("q0"));
    cluster.pump();
    cluster.finish("t1", Lane::Immediate, "q0", "ok");
    cluster.pump();

    let not_done = ResubmitRequest {
        msg_ids: vec!["t1".into(), "t2".into()],
    };
    assert_eq!(
        remote_ename(cluster.ask::<_, ResubmitReply>(QueryKind::Resubmit, &not_done)),
        "TaskNotDone"
    );
    assert!(scheduler.try_recv().is_none());

    let request = ResubmitRequest {
        msg_ids: vec!["t1".into()],
    };
    let (reply, _) = cluster
        .ask::<_, ResubmitReply>(QueryKind::Resubmit, &request)
        .unwrap();
    assert_eq!(reply.resubmitted, vec!["t1"]);

    let resent = scheduler.recv_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(resent.str_at(0).unwrap(), "hub-resubmit");
    assert_eq!(resent.str_at(1).unwrap(), "t1");
    assert_eq!(resent.str_at(2).unwrap(), "body of t1");
    assert!(cluster.server.hub().ledger().get("t1").unwrap().resubmitted.is_some());
}

#[test]
fn test_dead_engine_tasks_are_stranded() {
    let mut cluster = Cluster::start(1, Duration::from_millis(300));
    let notes = SubSocket::connect(&cluster.ctx, &cluster.server.client_info().notification);
    cluster.submit("t1", Lane::Immediate, Some("q0"));
    cluster.submit("t2", Lane::Immediate, Some("q0"));
    cluster.submit("t3", Lane::Scheduled, Some("q0"));
    cluster.pump();
    cluster.finish("t2", Lane::Immediate, "q0", "real");
    cluster.pump();

    let heart = cluster.hearts.pop().unwrap();
    heart.stop();
    cluster.server.run_for(Duration::from_millis(250));

    // failed but not yet evicted
    let note = notes.recv_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(note.str_at(0).unwrap(), notification::UNREGISTRATION);
    assert!(cluster.server.hub().get_engine(EngineId(0)).is_ok());
    let (load, _) = cluster
        .ask::<_, LoadReply>(QueryKind::Load, &LoadRequest::default())
        .unwrap();
    assert!(load.is_empty());
    let (connection, _) = cluster
        .ask::<_, ConnectionReply>(QueryKind::Connection, &())
        .unwrap();
    assert!(connection.engines.is_empty());

    // a result arriving during the grace window is kept
    cluster.finish("t3", Lane::Scheduled, "q0", "just in time");
    cluster.server.run_for(Duration::from_millis(300));

    assert!(cluster.server.hub().get_engine(EngineId(0)).is_err());
    let (reply, frames) = cluster.results(&["t1", "t2", "t3"], false).unwrap();
    assert_eq!(reply.completed, vec!["t1", "t2", "t3"]);
    assert!(reply.results["t1"].stranded);
    assert!(!reply.results["t3"].stranded);
    assert_eq!(
        frames,
        vec![
            Bytes::from(stranded_content("t1")),
            Bytes::from("real"),
            Bytes::from("just in time"),
        ]
    );
}

#[test]
fn test_connection_request_lists_engines() {
    let mut cluster = Cluster::start(2, Duration::from_secs(2));
    let (reply, _) = cluster
        .ask::<_, ConnectionReply>(QueryKind::Connection, &())
        .unwrap();
    assert_eq!(&reply.client, cluster.server.client_info());
    assert_eq!(reply.engines[&EngineId(0)], "q0");
    assert_eq!(reply.engines[&EngineId(1)], "q1");
}

#[test]
fn test_malformed_query_is_dropped() {
    let mut cluster = Cluster::start(0, Duration::from_secs(2));
    cluster
        .client
        .send_raw(Message::new().with("bogus_request").with("{}"))
        .unwrap();
    cluster
        .client
        .send_raw(Message::new().with(QueryKind::Load.as_str()).with("not json"))
        .unwrap();
    cluster.pump();

    // neither got a reply; the next valid query is answered normally
    let (history, _) = cluster
        .ask::<_, HistoryReply>(QueryKind::History, &())
        .unwrap();
    assert!(history.history.is_empty());
}

#[test]
fn test_shutdown_request_stops_hub() {
    let mut cluster = Cluster::start(0, Duration::from_secs(2));
    let notes = SubSocket::connect(&cluster.ctx, &cluster.server.client_info().notification);

    cluster.client.send_request(QueryKind::Shutdown, &()).unwrap();
    let start = Instant::now();
    cluster.server.run_for(Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(1));

    let (ack, _) = cluster
        .client
        .recv_reply::<ShutdownAck>(QueryKind::Shutdown)
        .unwrap();
    assert_eq!(ack.delay_ms, 50);
    let note = notes.recv_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(note.str_at(0).unwrap(), notification::SHUTDOWN);
}
