//! Event sink that writes sync events to `tracing`

use efisync_core::{
    domain::CycleStatus,
    ports::{IEventSink, SyncEvent},
};
use tracing::{debug, error, info, warn};

/// Default sink for the daemon
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait::async_trait]
impl IEventSink for TracingEventSink {
    async fn emit(&self, event: &SyncEvent) {
        let name = event.name();
        match event {
            SyncEvent::TaskSucceeded {
                task_id,
                kind,
                path,
                bytes,
                attempts,
                duration_ms,
            } => info!(
                event = name,
                task_id = %task_id,
                kind = %kind,
                path = %path,
                bytes,
                attempts,
                duration_ms,
                "Task succeeded"
            ),
            SyncEvent::TaskFailed {
                task_id,
                kind,
                path,
                error_kind,
                message,
                attempts,
                dead,
            } => {
                if *dead {
                    error!(
                        event = name,
                        task_id = %task_id,
                        kind = %kind,
                        path = %path,
                        error_kind = %error_kind,
                        error = %message,
                        attempts,
                        "Task failed permanently"
                    );
                } else {
                    debug!(
                        event = name,
                        task_id = %task_id,
                        kind = %kind,
                        path = %path,
                        error_kind = %error_kind,
                        error = %message,
                        attempts,
                        "Task will be retried"
                    );
                }
            }
            SyncEvent::TaskEvicted {
                task_id,
                path,
                error_kind,
            } => error!(
                event = name,
                task_id = %task_id,
                path = %path,
                error_kind = ?error_kind,
                "Dead task dropped"
            ),
            SyncEvent::VolumeReconciled {
                volume_id,
                mount_path,
                extracted,
                injected,
                unchanged,
                bytes,
                duration_ms,
                error_kind,
            } => match error_kind {
                Some(kind) => warn!(
                    event = name,
                    volume_id = %volume_id,
                    mount_path = %mount_path,
                    extracted,
                    injected,
                    unchanged,
                    bytes,
                    duration_ms,
                    error_kind = %kind,
                    "Volume reconciled with errors"
                ),
                None => info!(
                    event = name,
                    volume_id = %volume_id,
                    mount_path = %mount_path,
                    extracted,
                    injected,
                    unchanged,
                    bytes,
                    duration_ms,
                    "Volume reconciled"
                ),
            },
            SyncEvent::CycleCompleted {
                trigger,
                status,
                files,
                bytes,
                errors,
                duration_ms,
            } => {
                if *status == CycleStatus::Failed {
                    error!(
                        event = name,
                        trigger = ?trigger,
                        status = %status,
                        files,
                        bytes,
                        errors,
                        duration_ms,
                        "Sync cycle failed"
                    );
                } else {
                    info!(
                        event = name,
                        trigger = ?trigger,
                        status = %status,
                        files,
                        bytes,
                        errors,
                        duration_ms,
                        "Sync cycle completed"
                    );
                }
            }
            SyncEvent::ReachabilityChanged { endpoint, from, to } => info!(
                event = name,
                endpoint = %endpoint,
                from = %from,
                to = %to,
                "Reachability changed"
            ),
        }
    }
}
