//! 定时刷新调度器
//!
//! 基于 Actor Model 的后台刷新：
//!
//! 1. 按固定间隔对所有已知租户调用 `refresh_all`
//! 2. 通过 `RefreshNow` 消息立即触发刷新并等待结果
//! 3. 单次刷新失败只记录日志，不会终止调度循环
//! 4. 定时刷新在独立任务中运行，消息循环始终可以响应；上一次尚未结束时跳过本次
//!
//! 间隔为 `None` 时只响应消息，不做定时刷新。

use crate::error::{RepoError, Result};
use crate::repo::{SyncResult, TenantKey};
use crate::services::ChartRepository;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// 一次刷新的结果（每个租户一项）
pub type RefreshOutcome = Vec<(TenantKey, SyncResult)>;

/// 调度器统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// 已执行的定时刷新次数
    pub ticks: u64,
    /// 定时刷新中失败的租户同步次数
    pub failed_syncs: u64,
    /// 因上一次刷新未结束而跳过的次数
    pub skipped_ticks: u64,
}

/// Actor 消息类型
#[derive(Debug)]
enum ActorMessage {
    /// 立即刷新；`tenant` 为空时刷新所有租户
    RefreshNow {
        tenant: Option<TenantKey>,
        respond_to: oneshot::Sender<RefreshOutcome>,
    },
    /// 获取统计信息
    GetStats {
        respond_to: oneshot::Sender<SchedulerStats>,
    },
    /// 停止 Actor
    Shutdown,
}

/// 调度器 Actor
struct SchedulerActor {
    repository: Arc<ChartRepository>,
    interval: Option<Duration>,
    stats: Arc<Mutex<SchedulerStats>>,
    /// 正在运行的定时刷新
    tick: Option<JoinHandle<()>>,
}

impl SchedulerActor {
    fn new(repository: Arc<ChartRepository>, interval: Option<Duration>) -> Self {
        Self {
            repository,
            interval,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
            tick: None,
        }
    }

    fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::RefreshNow { tenant, respond_to } => {
                // 在独立任务中执行，避免阻塞消息循环
                let repository = Arc::clone(&self.repository);
                tokio::spawn(async move {
                    let outcome = match tenant {
                        Some(key) => {
                            let result = repository.refresh(&key).await;
                            vec![(key, result)]
                        }
                        None => repository.refresh_all().await,
                    };
                    let _ = respond_to.send(outcome);
                });
            }
            ActorMessage::GetStats { respond_to } => {
                let _ = respond_to.send(*self.stats.lock());
            }
            ActorMessage::Shutdown => {
                // Actor 将在消息循环结束后停止
            }
        }
    }

    fn scheduled_refresh(&mut self) {
        if self.tick.as_ref().map_or(false, |tick| !tick.is_finished()) {
            self.stats.lock().skipped_ticks += 1;
            debug!("Previous scheduled refresh still running, skipping tick");
            return;
        }

        let tick = {
            let mut stats = self.stats.lock();
            stats.ticks += 1;
            stats.ticks
        };
        let repository = Arc::clone(&self.repository);
        let stats = Arc::clone(&self.stats);

        self.tick = Some(tokio::spawn(async move {
            let outcome = repository.refresh_all().await;

            let mut failed = 0;
            for (tenant, result) in &outcome {
                if let Err(e) = result {
                    failed += 1;
                    warn!(tenant = %tenant, error = %e, "Scheduled refresh failed");
                }
            }
            stats.lock().failed_syncs += failed;
            debug!(tick, tenants = outcome.len(), failed, "Scheduled refresh finished");
        }));
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ActorMessage>) {
        let period = self.interval.unwrap_or(Duration::from_secs(3600));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let scheduled = self.interval.is_some();

        loop {
            tokio::select! {
                msg = receiver.recv() => match msg {
                    Some(ActorMessage::Shutdown) | None => break,
                    Some(msg) => self.handle_message(msg),
                },
                _ = ticker.tick(), if scheduled => self.scheduled_refresh(),
            }
        }

        // 只放弃等待；已开始的同步由协调器在后台完成
        if let Some(tick) = self.tick.take() {
            tick.abort();
        }
        info!(ticks = self.stats.lock().ticks, "Refresh scheduler stopped");
    }
}

/// 调度器句柄（客户端）
#[derive(Debug)]
pub struct RefreshScheduler {
    sender: mpsc::UnboundedSender<ActorMessage>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshScheduler {
    /// 启动调度器；必须在 tokio 运行时中调用
    pub fn start(repository: Arc<ChartRepository>, interval: Option<Duration>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = SchedulerActor::new(repository, interval);

        match interval {
            Some(period) => info!(interval = ?period, "Refresh scheduler started"),
            None => info!("Periodic refresh disabled"),
        }

        let handle = tokio::spawn(async move {
            actor.run(receiver).await;
        });

        Self {
            sender,
            handle: Some(handle),
        }
    }

    fn stopped() -> RepoError {
        RepoError::internal("refresh scheduler has stopped")
    }

    /// 立即刷新并等待结果；`tenant` 为空时刷新所有租户
    pub async fn refresh_now(&self, tenant: Option<TenantKey>) -> Result<RefreshOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::RefreshNow {
                tenant,
                respond_to: tx,
            })
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ActorMessage::GetStats { respond_to: tx })
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())
    }

    /// 停止调度器并等待 Actor 退出
    pub async fn shutdown(mut self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }
}
