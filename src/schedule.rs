//! Periodic background work: the connectable sweep, the settings refresh and
//! replay retention.
//!
//! Every task is a `tokio::time::interval` loop returned as a `JoinHandle`;
//! the caller aborts them on shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScheduleConfig;
use crate::connect::Orchestrator;
use crate::model::Asset;
use crate::storage::Provider;
use crate::tunnel::Route;

const CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether `asset` accepts a TCP connection on its first protocol. Through a
/// gateway that means the jump host's own dial to the asset succeeded.
pub async fn check_asset(orch: &Orchestrator, asset: &Asset) -> bool {
    let gateway = if asset.gateway_id == 0 {
        None
    } else {
        match orch.store().gateway(asset.gateway_id).await {
            Ok(g) => Some(g),
            Err(e) => {
                debug!("Asset {} gateway lookup failed: {e}", asset.id);
                return false;
            }
        }
    };
    let check_id = format!("check-{}-{}", asset.id, Uuid::new_v4());
    let protocols = asset.protocols.join(",");
    let tunnels = orch.tunnels();
    let reachable = match tunnels
        .proxy(true, &check_id, &protocols, asset, gateway.as_ref())
        .await
    {
        Ok(route) => reach(asset.id, route).await,
        Err(e) => {
            debug!("Asset {} unresolvable: {e}", asset.id);
            false
        }
    };
    tunnels.close_tunnels(&[check_id.as_str()]).await;
    reachable
}

async fn reach(asset_id: u64, route: Route) -> bool {
    let addr = route.addr();
    let Ok(Ok(_conn)) = tokio::time::timeout(CHECK_TIMEOUT, TcpStream::connect(&addr)).await else {
        return false;
    };
    let Some(outcome) = route.outcome else {
        return true;
    };
    match tokio::time::timeout(CHECK_TIMEOUT, outcome).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(e))) => {
            debug!("Asset {asset_id} not reachable from its gateway: {e}");
            false
        }
        Ok(Err(_)) | Err(_) => false,
    }
}

/// Check every asset, at most `concurrency` at a time, and record the
/// outcome. Returns how many were reachable.
pub async fn sweep_connectable(orch: &Orchestrator, concurrency: usize) -> usize {
    let assets = match orch.store().list_assets().await {
        Ok(assets) => assets,
        Err(e) => {
            warn!("Connectable sweep skipped: {e}");
            return 0;
        }
    };
    let total = assets.len();
    let results: Vec<(u64, bool)> = stream::iter(assets)
        .map(|asset| async move { (asset.id, check_asset(orch, &asset).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut up = 0;
    for (asset_id, connectable) in results {
        up += usize::from(connectable);
        if let Err(e) = orch.store().set_connectable(asset_id, connectable).await {
            warn!("Asset {asset_id} connectable update failed: {e}");
        }
    }
    info!("Connectable sweep: {up}/{total} assets reachable");
    up
}

/// Pull the settings from the store into the live snapshot. Returns true
/// when they changed.
pub async fn refresh_settings(orch: &Orchestrator) -> bool {
    match orch.store().settings().await {
        Ok(settings) => {
            let changed = orch.settings().replace(settings);
            if changed {
                info!("Global settings updated");
            }
            changed
        }
        Err(e) => {
            warn!("Settings refresh failed: {e}");
            false
        }
    }
}

/// Delete recordings older than `retention_days`. Zero keeps everything.
pub async fn purge_replays(provider: &dyn Provider, retention_days: u64) -> usize {
    if retention_days == 0 {
        return 0;
    }
    let days = i64::try_from(retention_days).unwrap_or(i64::MAX);
    let cutoff = Utc::now() - chrono::TimeDelta::try_days(days).unwrap_or(chrono::TimeDelta::MAX);
    match provider.purge_older_than(cutoff).await {
        Ok(n) => {
            if n > 0 {
                info!("Purged {n} replays older than {retention_days} days");
            }
            n
        }
        Err(e) => {
            warn!("Replay purge failed: {e}");
            0
        }
    }
}

fn every(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Start the periodic tasks.
pub fn spawn(orch: &Arc<Orchestrator>, config: &ScheduleConfig, retention_days: u64) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if config.connectable_interval_secs > 0 {
        let orch = Arc::clone(orch);
        let concurrency = config.connectable_concurrency;
        let mut interval = every(Duration::from_secs(config.connectable_interval_secs));
        tasks.push(tokio::spawn(async move {
            loop {
                interval.tick().await;
                sweep_connectable(&orch, concurrency).await;
            }
        }));
    }

    if config.settings_refresh_secs > 0 {
        let orch = Arc::clone(orch);
        let mut interval = every(Duration::from_secs(config.settings_refresh_secs));
        tasks.push(tokio::spawn(async move {
            loop {
                interval.tick().await;
                refresh_settings(&orch).await;
            }
        }));
    }

    if retention_days > 0 {
        let orch = Arc::clone(orch);
        let mut interval = every(RETENTION_INTERVAL);
        tasks.push(tokio::spawn(async move {
            loop {
                interval.tick().await;
                purge_replays(orch.replay_provider().as_ref(), retention_days).await;
            }
        }));
    }

    tasks
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::connect::tests::{fixture, fixture_with, inventory_data, telnet_target};
    use crate::model::{Gateway, GlobalSettings};
    use crate::store::Store;
    use crate::tunnel::{ByteStream, GatewayClient, GatewayDialer, TunnelError};

    /// Jump host whose own dial to the asset either works or is refused.
    struct JumpHost {
        reaches_asset: bool,
    }

    #[async_trait]
    impl GatewayClient for JumpHost {
        async fn open_direct(&self, host: &str, port: u16) -> Result<Box<dyn ByteStream>, TunnelError> {
            if self.reaches_asset {
                let (near, _far) = tokio::io::duplex(64);
                Ok(Box::new(near))
            } else {
                Err(TunnelError::RemoteDial(format!("{host}:{port}: connection refused")))
            }
        }

        async fn closed(&self) {
            std::future::pending::<()>().await;
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl GatewayDialer for JumpHost {
        async fn dial(&self, _gateway: &Gateway) -> Result<Arc<dyn GatewayClient>, TunnelError> {
            Ok(Arc::new(JumpHost {
                reaches_asset: self.reaches_asset,
            }))
        }
    }

    async fn behind_gateway(reaches_asset: bool) -> crate::connect::tests::Fixture {
        let mut data = inventory_data(23);
        data.assets[0].gateway_id = 5;
        data.gateways = vec![Gateway {
            id: 5,
            name: "jump".into(),
            host: "10.0.0.1".into(),
            port: 22,
            ..Gateway::default()
        }];
        fixture_with(data, 3600, Arc::new(JumpHost { reaches_asset }), 4822).await
    }

    #[tokio::test]
    async fn test_gateway_refusal_marks_asset_unreachable() {
        let fx = behind_gateway(false).await;
        fx.inventory.set_connectable(1, true).await.unwrap();
        assert_eq!(sweep_connectable(&fx.orch, 4).await, 0);
        assert!(!fx.inventory.asset(1).await.unwrap().connectable);
        assert_eq!(fx.orch.tunnels().pool_count(5).await, None);
    }

    #[tokio::test]
    async fn test_gateway_dial_marks_asset_reachable() {
        let fx = behind_gateway(true).await;
        assert_eq!(sweep_connectable(&fx.orch, 4).await, 1);
        assert!(fx.inventory.asset(1).await.unwrap().connectable);
        assert_eq!(fx.orch.tunnels().pool_count(5).await, None);
    }

    #[tokio::test]
    async fn test_sweep_marks_reachable_assets() {
        let (port, _seen) = telnet_target().await;
        let fx = fixture(port, 3600).await;
        assert_eq!(sweep_connectable(&fx.orch, 4).await, 1);
        assert!(fx.inventory.asset(1).await.unwrap().connectable);
    }

    #[tokio::test]
    async fn test_sweep_marks_unreachable_assets() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let fx = fixture(port, 3600).await;
        fx.inventory.set_connectable(1, true).await.unwrap();
        assert_eq!(sweep_connectable(&fx.orch, 4).await, 0);
        assert!(!fx.inventory.asset(1).await.unwrap().connectable);
    }

    #[tokio::test]
    async fn test_refresh_settings() {
        let fx = fixture(1, 3600).await;
        assert!(!refresh_settings(&fx.orch).await);
        fx.inventory.set_settings(GlobalSettings {
            timeout: 5,
            ..GlobalSettings::default()
        });
        assert!(refresh_settings(&fx.orch).await);
        assert_eq!(fx.orch.settings().current().timeout, 5);
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_replays() {
        let fx = fixture(1, 3600).await;
        let provider = fx.orch.replay_provider();
        let body = b"{\"version\":2}\n".to_vec();
        let size = body.len() as u64;
        provider
            .upload("s1.cast", Box::new(std::io::Cursor::new(body)), size)
            .await
            .unwrap();
        assert_eq!(purge_replays(provider.as_ref(), 0).await, 0);
        assert_eq!(purge_replays(provider.as_ref(), 30).await, 0);
        assert!(provider.exists("s1.cast").await.unwrap());
    }
}
