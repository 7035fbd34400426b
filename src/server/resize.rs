//! Window-resize coalescing.
//!
//! SSH clients emit bursts of window-change events while the user drags
//! a corner. The sink (remote tty or menu) only needs the leading event
//! and the final size of each burst.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

const COOLDOWN: Duration = Duration::from_millis(100);

/// Apply resize events with leading-edge firing and a 100 ms cooldown.
///
/// The first event of a burst is applied immediately. During the
/// cooldown only the newest pending size is retained; at expiry it is
/// applied iff it differs from the last applied size, restarting the
/// cooldown. Runs until the sender side closes.
pub(crate) async fn coalesce<F, Fut>(mut rx: mpsc::UnboundedReceiver<(u16, u16)>, mut apply: F)
where
    F: FnMut((u16, u16)) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(size) = rx.recv().await {
        apply(size).await;
        let mut last = size;
        loop {
            tokio::time::sleep(COOLDOWN).await;
            let mut newest = None;
            while let Ok(pending) = rx.try_recv() {
                newest = Some(pending);
            }
            match newest {
                Some(pending) if pending != last => {
                    apply(pending).await;
                    last = pending;
                }
                _ => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recorder() -> (
        Arc<Mutex<Vec<(u16, u16)>>>,
        impl FnMut((u16, u16)) -> std::future::Ready<()>,
    ) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let apply = move |size| {
            sink.lock().unwrap().push(size);
            std::future::ready(())
        };
        (applied, apply)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_leading_and_trailing() {
        let (applied, apply) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce(rx, apply));

        tx.send((80, 24)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for w in 0u16..10 {
            tx.send((100 + w, 30)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(applied.lock().unwrap().as_slice(), &[(80, 24), (109, 30)]);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_trailing_size_is_not_reapplied() {
        let (applied, apply) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce(rx, apply));

        tx.send((80, 24)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..3 {
            tx.send((80, 24)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(applied.lock().unwrap().as_slice(), &[(80, 24)]);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_idle_fire_immediately() {
        let (applied, apply) = recorder();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce(rx, apply));

        tx.send((80, 24)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send((120, 40)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(applied.lock().unwrap().as_slice(), &[(80, 24), (120, 40)]);

        drop(tx);
        task.await.unwrap();
    }
}
