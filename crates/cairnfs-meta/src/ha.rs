//! HA role transitions.
//!
//! [`HaController`] owns the standby's edit log tailer. Promotion stops the
//! tailer at a segment boundary, replays everything left in shared storage
//! including the segment still being written, and only then hands the
//! namesystem its new role. Demotion resets safe mode and restarts tailing.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::ReplayConfig;
use crate::editlog::SegmentSource;
use crate::namesystem::Namesystem;
use crate::tailer::{EditLogTailer, TailerHandle, TailerStats};
use crate::termination::TerminationSink;
use crate::types::{HaRole, MetaError};

/// Drives standby/active transitions for one namesystem.
pub struct HaController {
    namesystem: Arc<Namesystem>,
    source: Arc<dyn SegmentSource>,
    sink: Arc<dyn TerminationSink>,
    replay_config: ReplayConfig,
    replay: Mutex<ReplayState>,
}

#[derive(Default)]
struct ReplayState {
    handle: Option<TailerHandle>,
    /// Set once replay halted on a fault; tailing is never restarted after.
    fault: Option<String>,
}

impl HaController {
    /// Creates a controller. Call [`start`](Self::start) to begin tailing.
    pub fn new(
        namesystem: Arc<Namesystem>,
        source: Arc<dyn SegmentSource>,
        sink: Arc<dyn TerminationSink>,
        replay_config: ReplayConfig,
    ) -> Self {
        Self {
            namesystem,
            source,
            sink,
            replay_config,
            replay: Mutex::new(ReplayState::default()),
        }
    }

    /// The namesystem this controller drives.
    pub fn namesystem(&self) -> &Arc<Namesystem> {
        &self.namesystem
    }

    /// Current role.
    pub fn role(&self) -> Result<HaRole, MetaError> {
        self.namesystem.role()
    }

    fn new_tailer(&self) -> EditLogTailer {
        EditLogTailer::new(
            self.namesystem.clone(),
            self.source.clone(),
            self.sink.clone(),
            self.replay_config.clone(),
        )
    }

    fn resume_tailing(&self, state: &mut ReplayState) {
        if state.handle.is_some() {
            return;
        }
        match &state.fault {
            Some(fault) => {
                tracing::warn!(%fault, "edit log replay is halted, not restarting tailer");
            }
            None => state.handle = Some(self.new_tailer().start()),
        }
    }

    /// Starts the background tailer if the node is a standby.
    pub async fn start(&self) -> Result<(), MetaError> {
        let mut state = self.replay.lock().await;
        if self.namesystem.role()? == HaRole::Standby {
            self.resume_tailing(&mut state);
        }
        Ok(())
    }

    /// Standby -> active.
    ///
    /// A replay fault during the final catch-up has already been handed to
    /// the termination sink when this returns the error. If the tailer had
    /// halted earlier, promotion is refused with
    /// [`MetaError::ReplayHalted`] and the sink is not called again. Any
    /// other failure leaves the node standby with tailing resumed.
    pub async fn transition_to_active(&self) -> Result<(), MetaError> {
        let mut state = self.replay.lock().await;
        if self.namesystem.role()? == HaRole::Active {
            return Ok(());
        }
        if let Some(fault) = &state.fault {
            return Err(MetaError::ReplayHalted(fault.clone()));
        }

        let mut tailer = match state.handle.take() {
            Some(handle) => match handle.stop().await {
                Ok(tailer) => tailer,
                Err(e) => {
                    tracing::warn!(error = %e, "tailer task failed, promotion aborted");
                    self.resume_tailing(&mut state);
                    return Err(e);
                }
            },
            None => self.new_tailer(),
        };
        tracing::info!(
            last_applied = %self.namesystem.last_applied_txid()?,
            "promoting: final edit log catch-up"
        );
        if let Err(e) = tailer.catch_up(true) {
            match tailer.fault().map(str::to_string) {
                Some(fault) => {
                    tracing::error!(%fault, "promotion aborted, edit log replay halted");
                    state.fault = Some(fault);
                }
                None => {
                    tracing::warn!(error = %e, "promotion catch-up failed, staying standby");
                    state.handle = Some(tailer.start());
                }
            }
            return Err(e);
        }
        self.namesystem.on_promoted()
    }

    /// Active -> standby: safe mode goes back on and tailing resumes.
    pub async fn transition_to_standby(&self) -> Result<(), MetaError> {
        let mut state = self.replay.lock().await;
        if self.namesystem.role()? == HaRole::Active {
            self.namesystem.on_demoted()?;
        }
        self.resume_tailing(&mut state);
        Ok(())
    }

    /// Asks the tailer to poll now. Returns false when no tailer is running.
    pub async fn wake_tailer(&self) -> bool {
        match self.replay.lock().await.handle.as_ref() {
            Some(handle) if handle.is_running() => {
                handle.wake();
                true
            }
            _ => false,
        }
    }

    /// Counters of the tailer, if one was started and not yet stopped.
    pub async fn tailer_stats(&self) -> Option<TailerStats> {
        self.replay.lock().await.handle.as_ref().map(|h| h.stats())
    }

    /// Stops the tailer, if running.
    pub async fn shutdown(&self) -> Result<(), MetaError> {
        let handle = self.replay.lock().await.handle.take();
        if let Some(handle) = handle {
            handle.stop().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SafeModeConfig;
    use crate::editlog::{EditLogSegment, EditOp, SharedEditLog, Transaction};
    use crate::namespace::NamespaceSnapshot;
    use crate::termination::RecordingTerminationSink;
    use crate::types::{BlockId, GenStamp, OperationCategory, TxId};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Shared log whose next in-progress read fails with a storage error.
    struct FlakySource {
        log: Arc<SharedEditLog>,
        fail_next_in_progress: AtomicBool,
    }

    impl SegmentSource for FlakySource {
        fn segments_from(
            &self,
            from: TxId,
            include_in_progress: bool,
        ) -> Result<Vec<EditLogSegment>, MetaError> {
            if include_in_progress && self.fail_next_in_progress.swap(false, Ordering::SeqCst) {
                return Err(MetaError::SourceError("shared storage unreachable".to_string()));
            }
            self.log.segments_from(from, include_in_progress)
        }
    }

    fn add(block: u64) -> EditOp {
        EditOp::AddBlock {
            block: BlockId::new(block),
            gen_stamp: GenStamp::new(1000 + block),
            expected_replicas: 3,
        }
    }

    fn controller(
        source: Arc<dyn SegmentSource>,
        poll_interval_ms: u64,
    ) -> (HaController, Arc<RecordingTerminationSink>) {
        let fs = Arc::new(
            Namesystem::new(
                &SafeModeConfig {
                    extension_ms: 0,
                    ..SafeModeConfig::default()
                },
                NamespaceSnapshot::new(),
                HaRole::Standby,
                Arc::new(ManualClock::new(0)),
            )
            .unwrap(),
        );
        let sink = Arc::new(RecordingTerminationSink::new());
        let ctl = HaController::new(fs, source, sink.clone(), ReplayConfig { poll_interval_ms });
        (ctl, sink)
    }

    #[tokio::test]
    async fn test_promotion_reads_in_progress_segment() {
        let log = Arc::new(SharedEditLog::new());
        let (ctl, sink) = controller(log.clone(), 3_600_000);
        ctl.start().await.unwrap();

        log.log(EditOp::SetGenStamp {
            gen_stamp: GenStamp::new(1001),
        })
        .unwrap();
        log.log(add(1)).unwrap();

        ctl.transition_to_active().await.unwrap();
        assert_eq!(ctl.role().unwrap(), HaRole::Active);
        assert_eq!(ctl.namesystem().last_applied_txid().unwrap(), TxId::new(2));
        assert!(ctl.tailer_stats().await.is_none());
        assert!(!ctl.wake_tailer().await);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_promote_twice_is_noop() {
        let log = Arc::new(SharedEditLog::new());
        let (ctl, _) = controller(log, 3_600_000);
        ctl.transition_to_active().await.unwrap();
        ctl.transition_to_active().await.unwrap();
        assert_eq!(ctl.role().unwrap(), HaRole::Active);
    }

    #[tokio::test]
    async fn test_failed_promotion_resumes_tailing() {
        let log = Arc::new(SharedEditLog::new());
        let source = Arc::new(FlakySource {
            log: log.clone(),
            fail_next_in_progress: AtomicBool::new(true),
        });
        let (ctl, sink) = controller(source, 10);
        ctl.start().await.unwrap();

        let err = ctl.transition_to_active().await.unwrap_err();
        assert!(matches!(err, MetaError::SourceError(_)));
        assert_eq!(ctl.role().unwrap(), HaRole::Standby);
        assert!(ctl.wake_tailer().await);

        log.log(add(1)).unwrap();
        log.roll().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while ctl.namesystem().last_applied_txid().unwrap() < TxId::new(1) {
                ctl.wake_tailer().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.count(), 0);

        ctl.transition_to_active().await.unwrap();
        assert_eq!(ctl.role().unwrap(), HaRole::Active);
    }

    #[tokio::test]
    async fn test_promotion_refused_after_tailer_halts() {
        let log = Arc::new(SharedEditLog::new());
        let mut bad = EditLogSegment::new(vec![Transaction::new(TxId::new(1), add(1))], false)
            .unwrap();
        bad.checksum = [0u8; 32];
        log.push_raw_segment(bad).unwrap();
        let (ctl, sink) = controller(log, 10);
        ctl.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !ctl.tailer_stats().await.map_or(false, |s| s.halted) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.count(), 1);

        assert!(matches!(
            ctl.transition_to_active().await,
            Err(MetaError::ReplayHalted(_))
        ));
        assert!(matches!(
            ctl.transition_to_active().await,
            Err(MetaError::ReplayHalted(_))
        ));
        assert_eq!(ctl.role().unwrap(), HaRole::Standby);
        assert_eq!(sink.count(), 1);

        ctl.transition_to_standby().await.unwrap();
        assert!(ctl.tailer_stats().await.is_none());
        assert!(!ctl.wake_tailer().await);
    }

    #[tokio::test]
    async fn test_demotion_restarts_tailer_and_safe_mode() {
        let log = Arc::new(SharedEditLog::new());
        let (ctl, _) = controller(log, 3_600_000);
        ctl.transition_to_active().await.unwrap();
        assert!(ctl
            .namesystem()
            .check_operation(OperationCategory::Write)
            .is_ok());

        ctl.transition_to_standby().await.unwrap();
        assert_eq!(ctl.role().unwrap(), HaRole::Standby);
        assert!(ctl.wake_tailer().await);
        assert!(matches!(
            ctl.namesystem().check_operation(OperationCategory::Write),
            Err(MetaError::StandbyState(_))
        ));
        ctl.shutdown().await.unwrap();
        assert!(ctl.tailer_stats().await.is_none());
    }
}
