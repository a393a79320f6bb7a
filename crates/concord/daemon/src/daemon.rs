//! Bus wiring and lifecycle management

use std::sync::Arc;

use concord_bus::{AuditQueue, MessageBus, TracingAuditSink};
use concord_registry::registry_for;
use concord_resilience::{
    ChaosEngine, CircuitBreakerRegistry, HealthStatus, RecoveryOrchestrator,
};
use concord_types::Cancellation;
use concord_validation::build_pipeline;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, MonitorConfig};
use crate::error::DaemonResult;

/// Concord daemon: one bus with its background workers
pub struct Daemon {
    config: DaemonConfig,
    bus: Arc<MessageBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    audit: Arc<AuditQueue>,
}

impl Daemon {
    /// Build the bus and its collaborators from configuration
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let bus_config = config.bus.clone();
        bus_config.validate()?;

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            bus_config.circuit_breaker.clone(),
        ));
        let registry = registry_for(None, None);
        let pipeline = build_pipeline(&bus_config, None, breakers.clone())?;

        let recovery = Arc::new(
            RecoveryOrchestrator::new(bus_config.recovery.clone()).with_breakers(breakers.clone()),
        );
        let audit = Arc::new(AuditQueue::new(bus_config.audit.queue_capacity));

        let mut builder = MessageBus::builder(bus_config.clone(), registry, Arc::new(pipeline))
            .with_breakers(breakers.clone())
            .with_recovery(recovery)
            .with_audit(audit.clone());

        if bus_config.chaos.enabled {
            warn!(
                max_scenarios = bus_config.chaos.max_concurrent_scenarios,
                max_blast_radius = bus_config.chaos.max_blast_radius,
                "Fault injection enabled"
            );
            let chaos = ChaosEngine::new(
                bus_config.chaos.clone(),
                bus_config.policy_commitment.clone(),
            )
            .with_breakers(breakers.clone());
            builder = builder.with_chaos(Arc::new(chaos));
        }

        Ok(Self {
            config,
            bus: Arc::new(builder.build()?),
            breakers,
            audit,
        })
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves, then stop every worker
    pub async fn run_until(
        self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> DaemonResult<()> {
        let (handle, cancellation) = Cancellation::new();

        let recovery_worker = self.bus.spawn_recovery_worker(cancellation.clone());
        let audit_drain = self
            .audit
            .spawn_drain(Arc::new(TracingAuditSink), cancellation.clone());
        let monitor = spawn_health_monitor(
            self.config.monitor.clone(),
            self.breakers.clone(),
            self.bus.clone(),
            cancellation,
        );

        info!(
            node_id = %self.bus.node_id(),
            policy_commitment = %self.config.bus.policy_commitment,
            fail_closed = self.config.bus.validation.fail_closed,
            "Concord daemon running"
        );

        shutdown.await;
        info!("Concord daemon shutting down");
        handle.cancel();

        if let Some(worker) = recovery_worker {
            worker.await?;
        }
        audit_drain.await?;
        monitor.await?;

        let metrics = self.bus.metrics().await;
        info!(
            sent = metrics.sent,
            delivered = metrics.delivered,
            rejected = metrics.rejected,
            handler_failures = metrics.handler_failures,
            audit_dropped = metrics.audit_dropped,
            "Final bus metrics"
        );
        Ok(())
    }
}

/// Log health and metrics periodically and every circuit transition as it happens
fn spawn_health_monitor(
    config: MonitorConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    bus: Arc<MessageBus>,
    cancellation: Cancellation,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.health_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut transitions = breakers.transitions();

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = breakers.snapshot();
                    let metrics = bus.metrics().await;
                    let open = snapshot.open_circuits().join(",");
                    match snapshot.status {
                        HealthStatus::Healthy => info!(
                            health_score = snapshot.health_score,
                            status = %snapshot.status,
                            delivered = metrics.delivered,
                            rejected = metrics.rejected,
                            registered_agents = metrics.registered_agents,
                            "Bus health"
                        ),
                        HealthStatus::Degraded | HealthStatus::Critical => warn!(
                            health_score = snapshot.health_score,
                            status = %snapshot.status,
                            open_circuits = %open,
                            delivered = metrics.delivered,
                            rejected = metrics.rejected,
                            "Bus health"
                        ),
                    }
                }
                transition = transitions.recv() => match transition {
                    Ok(transition) => warn!(
                        dependency = %transition.dependency,
                        from = %transition.from,
                        to = %transition.to,
                        "Circuit state changed"
                    ),
                    Err(RecvError::Lagged(missed)) => warn!(missed, "Missed circuit transitions"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_types::StrategyKind;

    #[test]
    fn dynamic_policy_without_backend_is_rejected() {
        let mut config = DaemonConfig::default();
        config.bus.validation.strategies.push(StrategyKind::DynamicPolicy);
        assert!(Daemon::new(config).is_err());
    }

    #[tokio::test]
    async fn runs_until_shutdown() {
        let mut config = DaemonConfig::default();
        config.bus.chaos.enabled = true;
        let daemon = Daemon::new(config).unwrap();
        assert_eq!(daemon.bus.metrics().await.sent, 0);

        daemon
            .run_until(tokio::time::sleep(std::time::Duration::from_millis(20)))
            .await
            .unwrap();
    }
}
