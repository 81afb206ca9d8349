// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Event loop that drives a [`MediaAgent`] for one page.
//!
//! Activity reports are sent without blocking the loop, so commands the
//! coordinator issues while handling a report (a profile restore, say) are
//! applied before that report is acknowledged.

use crate::agent::MediaAgent;
use crate::page::{MediaEvent, MutationRecord, PageDocument};
use crate::schedule::ScheduledTask;
use crate::transport::{CommandSink, Connection};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tabmix_ipc::{
    ActivityReportPayload, AgentCommand, AgentReply, AgentRequest, Command, ContextId, TabmixError,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Bursts of added nodes within this window trigger a single rescan.
pub const MUTATION_COALESCE: Duration = Duration::from_millis(100);

/// Wait before resending an activity report the coordinator did not accept.
pub const REPORT_RETRY: Duration = Duration::from_secs(1);

/// Where activity reports go.
pub trait ActivitySink: Send + Sync {
    fn report(&self, report: ActivityReportPayload) -> BoxFuture<'static, Result<Value, TabmixError>>;
}

impl ActivitySink for Connection {
    fn report(&self, report: ActivityReportPayload) -> BoxFuture<'static, Result<Value, TabmixError>> {
        self.send(Command::ActivityReport(report))
    }
}

/// The fields of a report whose change is worth telling the coordinator.
#[derive(Debug, Clone, PartialEq)]
struct ReportKey {
    is_active: bool,
    media_kinds: Vec<String>,
    url: String,
    title: String,
}

impl From<&ActivityReportPayload> for ReportKey {
    fn from(report: &ActivityReportPayload) -> Self {
        Self {
            is_active: report.is_active,
            media_kinds: report.media_kinds.clone(),
            url: report.url.clone(),
            title: report.title.clone(),
        }
    }
}

pub struct AgentHost {
    agent: MediaAgent,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
    sink: Arc<dyn ActivitySink>,
    last_report: Option<ReportKey>,
    reports: FuturesUnordered<BoxFuture<'static, (ReportKey, Result<Value, TabmixError>)>>,
}

impl AgentHost {
    pub fn new(
        context_id: ContextId,
        document: Arc<dyn PageDocument>,
        sink: Arc<dyn ActivitySink>,
    ) -> Self {
        let (agent, media_events) = MediaAgent::new(context_id, document);
        Self {
            agent,
            media_events,
            sink,
            last_report: None,
            reports: FuturesUnordered::new(),
        }
    }

    pub fn agent(&self) -> &MediaAgent {
        &self.agent
    }

    /// Run until shutdown or until the coordinator link closes, then clean
    /// up the page. Returns the agent for inspection.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AgentRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> MediaAgent {
        let context_id = self.agent.context_id();
        let mut mutations = match self.agent.observe_mutations() {
            Ok(receiver) => Some(receiver),
            Err(e) => {
                warn!("Context {} cannot observe mutations: {}", context_id, e);
                None
            }
        };
        let tracked = self.agent.scan();
        info!("Agent for context {} started, {} media elements", context_id, tracked.len());
        self.report_if_changed();

        let (rescan_tx, mut rescan_rx) = mpsc::unbounded_channel::<()>();
        let mut rescan = ScheduledTask::new();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<()>();
        let mut retry = ScheduledTask::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                request = commands.recv() => match request {
                    Some(request) => {
                        self.handle(request);
                        self.report_if_changed();
                    }
                    None => {
                        info!("Coordinator link for context {} closed", context_id);
                        break;
                    }
                },
                Some(event) = self.media_events.recv() => {
                    if self.agent.on_media_event(event) {
                        self.report_if_changed();
                    }
                }
                Some(record) = next_mutation(&mut mutations) => {
                    if record.adds_media() {
                        let tx = rescan_tx.clone();
                        rescan.schedule_if_idle(MUTATION_COALESCE, async move {
                            let _ = tx.send(());
                        });
                    }
                }
                Some(()) = rescan_rx.recv() => {
                    self.agent.scan();
                    self.report_if_changed();
                }
                Some((key, result)) = self.reports.next(), if !self.reports.is_empty() => {
                    if let Err(e) = result {
                        warn!("Activity report for context {} failed: {}", context_id, e);
                        // A newer report supersedes the failed one.
                        if self.last_report.as_ref() == Some(&key) {
                            self.last_report = None;
                            let tx = retry_tx.clone();
                            retry.schedule_if_idle(REPORT_RETRY, async move {
                                let _ = tx.send(());
                            });
                        }
                    }
                }
                Some(()) = retry_rx.recv() => {
                    self.report_if_changed();
                }
            }
        }

        rescan.cancel();
        retry.cancel();
        self.agent.cleanup();
        self.agent
    }

    fn handle(&mut self, request: AgentRequest) {
        debug!("Context {} received {}", self.agent.context_id(), request.command.kind_str());
        let reply: AgentReply = match request.command {
            AgentCommand::ApplyVolume { level } => to_reply(&self.agent.apply_volume(level)),
            AgentCommand::ApplyMute { muted } => to_reply(&self.agent.set_muted(muted)),
            AgentCommand::AgentStatus => to_reply(&self.agent.status()),
        };
        if request.reply.send(reply).is_err() {
            debug!("Reply for context {} had no waiter", self.agent.context_id());
        }
    }

    fn report_if_changed(&mut self) {
        let report = self.agent.report_activity();
        let key = ReportKey::from(&report);
        if self.last_report.as_ref() == Some(&key) {
            return;
        }
        debug!(
            "Context {} reporting active={} kinds={:?}",
            report.context_id, report.is_active, report.media_kinds
        );
        self.last_report = Some(key.clone());
        let sent = self.sink.report(report);
        self.reports.push(Box::pin(async move { (key, sent.await) }));
    }
}

fn to_reply<T: serde::Serialize>(value: &T) -> AgentReply {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

async fn next_mutation(
    mutations: &mut Option<mpsc::UnboundedReceiver<MutationRecord>>,
) -> Option<MutationRecord> {
    match mutations {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDocument, MemoryElement, MemoryGraph};
    use crate::page::MediaKind;
    use parking_lot::Mutex;
    use serde_json::json;
    use tabmix_ipc::VolumeLevel;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<ActivityReportPayload>>,
        failures_left: Mutex<usize>,
    }

    impl ActivitySink for RecordingSink {
        fn report(
            &self,
            report: ActivityReportPayload,
        ) -> BoxFuture<'static, Result<Value, TabmixError>> {
            self.reports.lock().push(report);
            let mut failures_left = self.failures_left.lock();
            if *failures_left > 0 {
                *failures_left -= 1;
                return Box::pin(async { Err(TabmixError::Unavailable("coordinator busy".into())) });
            }
            Box::pin(async { Ok(json!({})) })
        }
    }

    impl RecordingSink {
        fn activity(&self) -> Vec<bool> {
            self.reports.lock().iter().map(|r| r.is_active).collect()
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<AgentRequest>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<MediaAgent>,
    }

    fn start(document: Arc<MemoryDocument>, sink: Arc<RecordingSink>) -> Harness {
        let host = AgentHost::new(3, document, sink);
        let (commands, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(host.run(rx, shutdown_rx));
        Harness {
            commands,
            shutdown,
            task,
        }
    }

    impl Harness {
        async fn send(&self, command: AgentCommand) -> Value {
            let (reply, result) = oneshot::channel();
            self.commands.send(AgentRequest { command, reply }).unwrap();
            result.await.unwrap().unwrap()
        }

        async fn stop(self) -> MediaAgent {
            self.shutdown.send(true).unwrap();
            self.task.await.unwrap()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_initial_and_transitions() {
        let document = Arc::new(MemoryDocument::new("https://a.com/watch", "A"));
        let element = Arc::new(MemoryElement::new(1, MediaKind::Video));
        document.add_element(element.clone());
        let sink = Arc::new(RecordingSink::default());
        let harness = start(document, sink.clone());

        settle().await;
        assert_eq!(sink.activity(), vec![false]);

        element.play();
        settle().await;
        assert_eq!(sink.activity(), vec![false, true]);

        // Repeated events without a state change are not reported.
        element.play();
        settle().await;
        assert_eq!(sink.activity(), vec![false, true]);

        element.pause();
        settle().await;
        assert_eq!(sink.activity(), vec![false, true, false]);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_apply_and_reply() {
        let graph = Arc::new(MemoryGraph::new());
        let document =
            Arc::new(MemoryDocument::new("https://a.com", "A").with_graph(graph.clone()));
        let element = Arc::new(MemoryElement::new(1, MediaKind::Audio));
        document.add_element(element.clone());
        let sink = Arc::new(RecordingSink::default());
        let harness = start(document, sink);
        settle().await;

        let ack = harness
            .send(AgentCommand::ApplyVolume {
                level: VolumeLevel::new(150).unwrap(),
            })
            .await;
        assert_eq!(ack["applied"], 1);
        assert_eq!(ack["amplificationUnavailable"], false);
        assert_eq!(element.current_volume(), 1.0);
        assert_eq!(graph.gain_of(1), Some(1.5));

        let ack = harness.send(AgentCommand::ApplyMute { muted: true }).await;
        assert_eq!(ack["applied"], 1);
        assert!(element.is_muted());

        let status = harness.send(AgentCommand::AgentStatus).await;
        assert_eq!(status["tracked"], 1);
        assert_eq!(status["amplification"], "Available");

        let agent = harness.stop().await;
        assert!(agent.tracked_ids().is_empty());
        assert_eq!(graph.gain_of(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_burst_rescans_once() {
        let document = Arc::new(MemoryDocument::new("https://a.com", "A"));
        let sink = Arc::new(RecordingSink::default());
        let harness = start(document.clone(), sink.clone());
        settle().await;
        assert_eq!(sink.reports.lock().len(), 1);

        for id in 1..=3 {
            let element = MemoryElement::new(id, MediaKind::Audio);
            element.play();
            document.add_element(Arc::new(element));
        }
        settle().await;
        assert!(sink.reports.lock()[0].media_kinds.is_empty());

        tokio::time::sleep(MUTATION_COALESCE + Duration::from_millis(10)).await;
        settle().await;

        let status = harness.send(AgentCommand::AgentStatus).await;
        assert_eq!(status["tracked"], 3);
        let reports = sink.reports.lock().clone();
        assert_eq!(reports.len(), 2);
        assert!(reports[1].is_active);
        assert_eq!(reports[1].media_kinds, vec!["audio".to_string()]);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_nodes_do_not_rescan() {
        let document = Arc::new(MemoryDocument::new("https://a.com", "A"));
        let element = Arc::new(MemoryElement::new(1, MediaKind::Audio));
        document.add_element(element.clone());
        let sink = Arc::new(RecordingSink::default());
        let harness = start(document.clone(), sink.clone());
        settle().await;

        document.add_plain_node("div");
        tokio::time::sleep(MUTATION_COALESCE + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(sink.reports.lock().len(), 1);

        // The next report carries the current title.
        document.set_title("Now playing");
        element.play();
        settle().await;
        let reports = sink.reports.lock().clone();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].title, "Now playing");

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_report_is_resent() {
        let document = Arc::new(MemoryDocument::new("https://a.com", "A"));
        let element = Arc::new(MemoryElement::new(1, MediaKind::Audio));
        document.add_element(element.clone());
        let sink = Arc::new(RecordingSink::default());
        let harness = start(document, sink.clone());
        settle().await;
        assert_eq!(sink.activity(), vec![false]);

        *sink.failures_left.lock() = 1;
        element.play();
        settle().await;
        assert_eq!(sink.activity(), vec![false, true]);

        tokio::time::sleep(REPORT_RETRY + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(sink.activity(), vec![false, true, true]);

        // Accepted, so nothing further goes out.
        tokio::time::sleep(REPORT_RETRY * 3).await;
        settle().await;
        assert_eq!(sink.activity(), vec![false, true, true]);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_close_cleans_up() {
        let document = Arc::new(MemoryDocument::new("https://a.com", "A"));
        let element = Arc::new(MemoryElement::new(1, MediaKind::Audio).with_volume(0.4));
        document.add_element(element.clone());
        let sink = Arc::new(RecordingSink::default());
        let harness = start(document.clone(), sink);
        settle().await;

        harness
            .send(AgentCommand::ApplyVolume {
                level: VolumeLevel::new(20).unwrap(),
            })
            .await;
        assert!((element.current_volume() - 0.2).abs() < 1e-9);

        drop(harness.commands);
        let agent = harness.task.await.unwrap();
        assert!(agent.tracked_ids().is_empty());
        assert!((element.current_volume() - 0.4).abs() < 1e-9);
        assert_eq!(document.observer_count(), 0);
        drop(harness.shutdown);
    }
}
