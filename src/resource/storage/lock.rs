use crate::resource::model::NodeId;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<NodeId, Arc<AsyncMutex<()>>>>>;

/// 按父节点划分的互斥锁表，同一父节点下的兄弟链修改必须串行
#[derive(Debug, Clone, Default)]
pub struct ParentLocks {
    slots: Slots,
}

impl ParentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, parent: NodeId) -> ParentLock {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots
                .entry(parent)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        debug!("等待父节点锁: {}", parent);
        let guard = slot.lock_owned().await;
        debug!("获得父节点锁: {}", parent);

        ParentLock {
            parent,
            slots: self.slots.clone(),
            guard: Some(guard),
        }
    }
}

/// 持有期间独占某个父节点的兄弟链
#[derive(Debug)]
pub struct ParentLock {
    parent: NodeId,
    slots: Slots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ParentLock {
    pub fn parent(&self) -> NodeId {
        self.parent
    }
}

impl Drop for ParentLock {
    fn drop(&mut self) {
        drop(self.guard.take());

        // 没有其他等待者时回收锁槽
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(&self.parent) {
            if Arc::strong_count(slot) == 1 {
                slots.remove(&self.parent);
            }
        }
        debug!("释放父节点锁: {}", self.parent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let locks = ParentLocks::new();
        let first = locks.acquire(7).await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move { contender.acquire(7).await.parent() });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        assert_eq!(waiting.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn different_parents_do_not_block() {
        let locks = ParentLocks::new();
        let _a = locks.acquire(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_reclaimed() {
        let locks = ParentLocks::new();
        drop(locks.acquire(3).await);
        assert!(locks.slots.lock().unwrap().is_empty());
    }
}
