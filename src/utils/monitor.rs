use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// 取樣任務寫入、orchestrator 於批次之間讀取的資源量表（f32 以位元存成原子整數）
#[derive(Debug, Default)]
pub struct ResourceGauges {
    memory_pct: AtomicU32,
    cpu_pct: AtomicU32,
    samples: AtomicU64,
}

impl ResourceGauges {
    pub fn record(&self, memory_pct: f32, cpu_pct: f32) {
        self.memory_pct.store(memory_pct.to_bits(), Ordering::Relaxed);
        self.cpu_pct.store(cpu_pct.to_bits(), Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn memory_pct(&self) -> f32 {
        f32::from_bits(self.memory_pct.load(Ordering::Relaxed))
    }

    pub fn cpu_pct(&self) -> f32 {
        f32::from_bits(self.cpu_pct.load(Ordering::Relaxed))
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

/// 背景週期取樣；由 start/stop 明確控制生命週期
pub struct ResourceSampler {
    gauges: Arc<ResourceGauges>,
    interval: Duration,
    started_at: Instant,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ResourceSampler {
    pub fn new(interval: Duration) -> Self {
        Self {
            gauges: Arc::new(ResourceGauges::default()),
            interval: interval.max(Duration::from_millis(10)),
            started_at: Instant::now(),
            stop: None,
            handle: None,
        }
    }

    pub fn gauges(&self) -> Arc<ResourceGauges> {
        Arc::clone(&self.gauges)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// 需在 tokio runtime 中呼叫；重複呼叫不會產生第二個任務
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let gauges = Arc::clone(&self.gauges);
        let period = self.interval;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let (memory, cpu) = sample(&mut system);
                        gauges.record(memory, cpu);
                    }
                }
            }
        });

        self.started_at = Instant::now();
        self.stop = Some(stop_tx);
        self.handle = Some(handle);
        tracing::debug!("Resource sampler started ({:?} interval)", period);
    }

    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Resource sampler task ended abnormally: {}", e);
            }
            tracing::debug!(
                "Resource sampler stopped after {} samples",
                self.gauges.samples()
            );
        }
    }

    pub fn log_stats(&self, phase: &str) {
        if !self.is_running() {
            return;
        }
        tracing::info!(
            "📊 {} - CPU: {:.1}%, Memory: {:.1}%, Time: {:?}",
            phase,
            self.gauges.cpu_pct(),
            self.gauges.memory_pct(),
            self.started_at.elapsed()
        );
    }
}

impl Drop for ResourceSampler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// 回傳（記憶體使用率, 全域 CPU 使用率），皆為百分比
fn sample(system: &mut System) -> (f32, f32) {
    system.refresh_memory();
    system.refresh_cpu_usage();

    let total = system.total_memory();
    let memory = if total > 0 {
        (system.used_memory() as f64 / total as f64 * 100.0) as f32
    } else {
        0.0
    };
    (memory, system.global_cpu_usage())
}
