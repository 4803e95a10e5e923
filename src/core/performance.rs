use crate::utils::error::Result;
use rusqlite::Connection;
use std::time::Duration;

/// 批次在此時間內完成且無資源壓力時放大批次
const FAST_BATCH: Duration = Duration::from_secs(1);

const MEMORY_PRESSURE_FACTOR: f64 = 0.8;
const CPU_PRESSURE_FACTOR: f64 = 0.9;
const GROWTH_FACTOR: f64 = 1.2;

/// 依資源壓力與上一批耗時調整批次大小
#[derive(Debug, Clone)]
pub struct PerformanceController {
    min_batch_size: usize,
    max_batch_size: usize,
    memory_threshold: f32,
    cpu_threshold: f32,
}

impl PerformanceController {
    pub fn new(
        min_batch_size: usize,
        max_batch_size: usize,
        memory_threshold: f32,
        cpu_threshold: f32,
    ) -> Self {
        let min_batch_size = min_batch_size.max(1);
        Self {
            min_batch_size,
            max_batch_size: max_batch_size.max(min_batch_size),
            memory_threshold,
            cpu_threshold,
        }
    }

    pub fn clamp(&self, size: usize) -> usize {
        size.clamp(self.min_batch_size, self.max_batch_size)
    }

    pub fn next_batch_size(
        &self,
        current: usize,
        last_duration: Duration,
        mem_pct: f32,
        cpu_pct: f32,
    ) -> usize {
        let memory_pressure = mem_pct > self.memory_threshold;
        let cpu_pressure = cpu_pct > self.cpu_threshold;

        let mut factor = 1.0;
        if memory_pressure {
            factor *= MEMORY_PRESSURE_FACTOR;
        }
        if cpu_pressure {
            factor *= CPU_PRESSURE_FACTOR;
        }
        if !memory_pressure && !cpu_pressure && last_duration < FAST_BATCH {
            factor = GROWTH_FACTOR;
        }

        let next = (current as f64 * factor).round() as usize;
        let clamped = self.clamp(next);
        if clamped != current {
            tracing::debug!(
                "Batch size {} -> {} (last {:?}, mem {:.1}%, cpu {:.1}%)",
                current,
                clamped,
                last_duration,
                mem_pct,
                cpu_pct
            );
        }
        clamped
    }
}

/// 套用大量寫入 pragma 前的設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PragmaSnapshot {
    pub synchronous: i64,
    pub journal_mode: String,
}

/// 關閉同步寫入並改用記憶體 journal；必須在 BEGIN 之前呼叫
pub fn apply_bulk_pragmas(conn: &Connection) -> Result<PragmaSnapshot> {
    let snapshot = PragmaSnapshot {
        synchronous: conn.query_row("PRAGMA synchronous", [], |row| row.get(0))?,
        journal_mode: conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?,
    };

    conn.pragma_update(None, "synchronous", "OFF")?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| row.get(0))?;
    tracing::debug!(
        "Bulk pragmas applied (journal_mode {} -> {})",
        snapshot.journal_mode,
        mode
    );
    Ok(snapshot)
}

pub fn restore_pragmas(conn: &Connection, snapshot: &PragmaSnapshot) -> Result<()> {
    let _: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        snapshot.journal_mode.as_str(),
        |row| row.get(0),
    )?;
    conn.pragma_update(None, "synchronous", snapshot.synchronous)?;
    tracing::debug!("Pragmas restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn controller() -> PerformanceController {
        PerformanceController::new(100, 10_000, 80.0, 80.0)
    }

    #[test]
    fn test_memory_pressure_shrinks() {
        assert_eq!(
            controller().next_batch_size(1000, Duration::from_millis(200), 90.0, 10.0),
            800
        );
    }

    #[test]
    fn test_fast_and_idle_grows_within_max() {
        assert_eq!(
            controller().next_batch_size(1000, Duration::from_millis(300), 10.0, 10.0),
            1200
        );

        let capped = PerformanceController::new(100, 1000, 80.0, 80.0);
        assert_eq!(
            capped.next_batch_size(1000, Duration::from_millis(300), 10.0, 10.0),
            1000
        );
    }

    #[test]
    fn test_combined_pressure_and_slow_batches() {
        let c = controller();
        assert_eq!(
            c.next_batch_size(1000, Duration::from_millis(100), 95.0, 95.0),
            720
        );
        assert_eq!(c.next_batch_size(1000, Duration::from_secs(2), 10.0, 10.0), 1000);
        assert_eq!(c.next_batch_size(110, Duration::from_secs(2), 95.0, 10.0), 100);
    }

    #[test]
    fn test_bulk_pragmas_round_trip() {
        let dir = TempDir::new().unwrap();
        let conn = Connection::open(dir.path().join("p.db")).unwrap();
        conn.execute_batch("CREATE TABLE t (a)").unwrap();

        let before = apply_bulk_pragmas(&conn).unwrap();
        let sync: i64 = conn.query_row("PRAGMA synchronous", [], |r| r.get(0)).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(sync, 0);
        assert_eq!(mode, "memory");

        restore_pragmas(&conn, &before).unwrap();
        let sync: i64 = conn.query_row("PRAGMA synchronous", [], |r| r.get(0)).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
        assert_eq!(sync, before.synchronous);
        assert_eq!(mode, before.journal_mode);
    }
}
