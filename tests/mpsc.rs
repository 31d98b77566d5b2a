use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use weir::{mpsc, BackpressureStrategy, ProduceError, SendResult};

#[tokio::test]
async fn watermark_backpressure_round_trip() {
    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::watermark(2, 4));

    let mut pending = None;
    for n in 1..=10u32 {
        match tx.send_sync(n).unwrap() {
            | SendResult::ProduceMore => {}
            | SendResult::Enqueue(token) => {
                pending = Some((n, token));
                break;
            }
        }
    }

    // Elements 1..=3 kept demand open; 4 closed it but was still committed.
    let (sent, token) = pending.expect("demand should close at the high watermark");
    assert_eq!(sent, 4);

    let (resume_tx, resume_rx) = std::sync::mpsc::channel();
    tx.enqueue_callback(token, move |result| resume_tx.send(result).unwrap());

    // The notification fires once the level drains below the low watermark.
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    assert!(resume_rx.try_recv().is_err());
    assert_eq!(rx.recv().await, Some(3));
    assert_eq!(resume_rx.try_recv().unwrap(), Ok(()));

    let produce = tokio::spawn(async move {
        for n in 5..=10u32 {
            tx.send(n).await.unwrap();
        }
        tx.finish();
    });

    let mut seen = Vec::new();
    while let Some(n) = rx.recv().await {
        seen.push(n);
    }

    assert_eq!(seen, vec![4, 5, 6, 7, 8, 9, 10]);
    produce.await.unwrap();
}

#[tokio::test]
async fn failure_is_thrown_once_after_the_buffer_drains() {
    let (tx, mut rx) = mpsc::fallible::<u32, String>(BackpressureStrategy::watermark(1, 4));

    tx.send(1).await.unwrap();
    tx.send(2).await.unwrap();
    tx.fail("boom".to_owned());

    assert_eq!(rx.next().await, Ok(Some(1)));
    assert_eq!(rx.next().await, Ok(Some(2)));
    assert_eq!(rx.next().await, Err("boom".to_owned()));
    assert_eq!(rx.next().await, Ok(None));
}

#[tokio::test]
async fn channel_finishes_once_every_source_is_dropped() {
    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::watermark(2, 8));
    let tx2 = tx.clone();

    assert_eq!(tx.send_sync(1).unwrap(), SendResult::ProduceMore);
    drop(tx);
    assert!(!tx2.is_finished());

    assert_eq!(tx2.send_sync(2).unwrap(), SendResult::ProduceMore);
    drop(tx2);

    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn dropping_the_consumer_fails_suspended_sends() {
    let (tx, rx) = mpsc::channel(BackpressureStrategy::watermark(1, 1));

    let suspended = tokio::spawn({
        let tx = tx.clone();
        async move { tx.send(1).await }
    });
    tokio::task::yield_now().await;

    drop(rx);

    assert_eq!(suspended.await.unwrap(), Err(ProduceError::AlreadyFinished));
    assert_eq!(tx.send_sync(2), Err(ProduceError::AlreadyFinished));
}

#[tokio::test]
async fn termination_callbacks_fire_exactly_once() {
    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::unbounded());
    let tx2 = tx.clone();

    let fired = Arc::new(AtomicUsize::new(0));
    tx.set_on_termination({
        let fired = fired.clone();
        move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(tx.send_sync(1).unwrap(), SendResult::ProduceMore);
    tx.finish();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // Callbacks fire once the buffer has fully drained.
    assert_eq!(rx.recv().await, Some(1));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(rx.recv().await, None);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Registration on a finished channel fires synchronously.
    tx2.set_on_termination({
        let fired = fired.clone();
        move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn batches_commit_atomically_in_order() {
    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::watermark(2, 8));

    tx.send_batch(1..=5u32).await.unwrap();

    let produce = tokio::spawn(async move {
        tx.send_batch(6..=10u32).await.unwrap();
        tx.finish();
    });

    let mut seen = Vec::new();
    while let Some(n) = rx.recv().await {
        seen.push(n);
    }

    assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    produce.await.unwrap();
}

#[tokio::test]
async fn send_all_forwards_a_stream() {
    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::watermark(1, 2));

    let produce = tokio::spawn(async move {
        tx.send_all(futures::stream::iter(1..=6u32)).await.unwrap();
        tx.finish();
    });

    let mut seen = Vec::new();
    while let Some(n) = rx.recv().await {
        seen.push(n);
    }

    assert_eq!(seen, (1..=6).collect::<Vec<_>>());
    produce.await.unwrap();
}

#[tokio::test]
async fn cancelled_notifications_observe_cancellation() {
    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::watermark(1, 1));

    let token = match tx.send_sync(1).unwrap() {
        | SendResult::Enqueue(token) => token,
        | other => panic!("expected demand to close, got {other:?}"),
    };

    let (resume_tx, resume_rx) = std::sync::mpsc::channel();
    tx.enqueue_callback(token, move |result| resume_tx.send(result).unwrap());
    tx.cancel_callback(token);

    assert_eq!(
        resume_rx.try_recv().unwrap(),
        Err(ProduceError::Cancelled)
    );

    // The committed element is still delivered.
    assert_eq!(rx.recv().await, Some(1));
}

#[tokio::test]
async fn weighted_watermark_counts_element_weight() {
    let strategy = BackpressureStrategy::watermark_weighted(4, 8, |chunk: &Vec<u8>| chunk.len());
    let (tx, mut rx) = mpsc::channel(strategy);

    assert_eq!(tx.send_sync(vec![0; 4]).unwrap(), SendResult::ProduceMore);
    let token = match tx.send_sync(vec![0; 4]).unwrap() {
        | SendResult::Enqueue(token) => token,
        | other => panic!("expected demand to close, got {other:?}"),
    };

    let (resume_tx, resume_rx) = std::sync::mpsc::channel();
    tx.enqueue_callback(token, move |result| resume_tx.send(result).unwrap());

    assert_eq!(rx.recv().await.map(|chunk| chunk.len()), Some(4));
    assert!(resume_rx.try_recv().is_err());

    assert_eq!(rx.recv().await.map(|chunk| chunk.len()), Some(4));
    assert_eq!(resume_rx.try_recv().unwrap(), Ok(()));
}

#[tokio::test]
async fn random_bursts_preserve_commit_order() {
    let mut rng = StdRng::seed_from_u64(7);
    let bursts: Vec<Vec<u32>> = (0..20)
        .map(|_| (0..rng.gen_range(1..8)).map(|_| rng.gen()).collect())
        .collect();
    let expected: Vec<u32> = bursts.iter().flatten().copied().collect();

    let (tx, mut rx) = mpsc::channel(BackpressureStrategy::watermark(8, 16));

    let produce = tokio::spawn(async move {
        for burst in bursts {
            tx.send_batch(burst).await.unwrap();
        }
        tx.finish();
    });

    let mut seen = Vec::new();
    while let Some(n) = rx.recv().await {
        seen.push(n);
    }

    assert_eq!(seen, expected);
    produce.await.unwrap();
}

#[tokio::test]
async fn unbounded_channels_never_close_demand() {
    let (tx, rx) = mpsc::channel(BackpressureStrategy::unbounded());

    for n in 0..1000u32 {
        assert_eq!(tx.send_sync(n).unwrap(), SendResult::ProduceMore);
    }
    tx.finish();

    let seen: Vec<_> = rx.collect().await;
    assert_eq!(seen.len(), 1000);
}

#[tokio::test]
async fn sources_cloned_after_finishing_are_inert() {
    let (tx, mut rx) = mpsc::channel::<u32>(BackpressureStrategy::unbounded());
    let tx2 = tx.clone();

    tx.finish();
    assert_eq!(rx.recv().await, None);

    let late = tx2.clone();
    assert_eq!(late.send_sync(1), Err(ProduceError::AlreadyFinished));
}

#[test]
#[should_panic(expected = "enqueued twice")]
fn registering_a_token_twice_panics() {
    let (tx, _rx) = mpsc::channel(BackpressureStrategy::watermark(1, 1));

    let token = match tx.send_sync(1).unwrap() {
        | SendResult::Enqueue(token) => token,
        | other => panic!("expected demand to close, got {other:?}"),
    };

    tx.enqueue_callback(token, |_| {});
    tx.enqueue_callback(token, |_| {});
}
