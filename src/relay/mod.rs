//! 隧道中继：在两个 Channel 之间双向搬运字节
//!
//! 每个方向一个任务、一块固定缓冲区。任一方向读到 0 字节或出错，两侧
//! Channel 都会被关闭且只关闭一次，另一方向的在途操作随之以 "closed" 结束。

pub mod datagram;

use crate::channel::SharedChannel;
use crate::stats::ServiceStatsTracker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// 每个方向的中继缓冲区大小
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// 隧道结束时各方向转发的字节数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// a → b
    pub a_to_b: u64,
    /// b → a
    pub b_to_a: u64,
}

/// 运行中的隧道
pub struct Tunnel {
    shared: Arc<TunnelShared>,
    forward: JoinHandle<u64>,
    backward: JoinHandle<u64>,
}

struct TunnelShared {
    a: SharedChannel,
    b: SharedChannel,
    torn_down: AtomicBool,
}

impl TunnelShared {
    fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "tunnel teardown");
        self.a.close();
        self.b.close();
    }
}

#[derive(Clone, Copy, Debug)]
enum Direction {
    AToB,
    BToA,
}

impl Tunnel {
    /// 绑定两个 Channel，立即开始双向中继
    ///
    /// 调用方交出两个 Channel 的所有权；此后只有隧道会读写或关闭它们。
    pub fn bind(a: SharedChannel, b: SharedChannel) -> Self {
        Self::bind_with_stats(a, b, None)
    }

    /// 同 [`Tunnel::bind`]，a 视为客户端侧，字节数计入服务统计
    pub fn bind_with_stats(
        a: SharedChannel,
        b: SharedChannel,
        stats: Option<ServiceStatsTracker>,
    ) -> Self {
        let shared = Arc::new(TunnelShared {
            a,
            b,
            torn_down: AtomicBool::new(false),
        });
        let forward = tokio::spawn(pump(shared.clone(), Direction::AToB, stats.clone()));
        let backward = tokio::spawn(pump(shared.clone(), Direction::BToA, stats));
        Self {
            shared,
            forward,
            backward,
        }
    }

    /// 主动拆除隧道
    pub fn close(&self) {
        self.shared.teardown("closed by owner");
    }

    /// 等待两个方向都结束
    pub async fn wait(self) -> TunnelStats {
        let a_to_b = self.forward.await.unwrap_or_default();
        let b_to_a = self.backward.await.unwrap_or_default();
        TunnelStats { a_to_b, b_to_a }
    }
}

async fn pump(
    shared: Arc<TunnelShared>,
    direction: Direction,
    stats: Option<ServiceStatsTracker>,
) -> u64 {
    let (from, to) = match direction {
        Direction::AToB => (shared.a.clone(), shared.b.clone()),
        Direction::BToA => (shared.b.clone(), shared.a.clone()),
    };
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let reason = loop {
        let n = match from.read(&mut buf).await {
            Ok(0) => break "eof",
            Ok(n) => n,
            Err(e) => {
                trace!(?direction, error = %e, "tunnel read ended");
                break "read error";
            }
        };
        if let Err(e) = to.write(&buf[..n]).await {
            trace!(?direction, error = %e, "tunnel write ended");
            break "write error";
        }
        total += n as u64;
        if let Some(stats) = &stats {
            match direction {
                Direction::AToB => stats.add_bytes_upstream(n as u64),
                Direction::BToA => stats.add_bytes_downstream(n as u64),
            }
        }
    };

    shared.teardown(reason);
    total
}
