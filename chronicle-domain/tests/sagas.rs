mod support;

use chronicle_domain::chronicle_core::persist::Backend;
use chronicle_domain::chronicle_core::saga::ReactionOutcome;
use chronicle_domain::{Domain, DomainConfig};
use std::future::ready;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use support::*;

fn counting(counter: &Arc<AtomicUsize>) -> chronicle_domain::chronicle_core::kind::Definition {
    let counter = counter.clone();
    notifier(move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn bank(
    backend: Backend,
    meta_backend: Backend,
    notifier: chronicle_domain::chronicle_core::kind::Definition,
    config: DomainConfig,
) -> Arc<Domain> {
    let domain = Domain::builder()
        .name("bank")
        .backend(backend)
        .meta_backend(meta_backend)
        .definitions(vec![accounts(), notifier])
        .config(config)
        .build()
        .unwrap();
    Arc::new(domain)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn started_domains_react_once_per_record() {
    let reactions = Arc::new(AtomicUsize::new(0));
    let domain = bank(
        Backend::in_memory(),
        Backend::in_memory(),
        counting(&reactions),
        fast_config(),
    );
    domain.start().await.unwrap();

    let first = domain.execute(deposit("acc-1", 1)).await.unwrap();
    domain.execute(deposit("acc-1", 2)).await.unwrap();
    domain.execute(deposit("acc-2", 3)).await.unwrap();
    // 不在订阅事件内的记录不会触发反应
    domain.execute(withdraw("acc-1", 1)).await.unwrap();

    wait_until("three reactions", || {
        ready(reactions.load(Ordering::SeqCst) == 3)
    })
    .await;

    let outcomes = domain.react_to(&first[0]).await.unwrap();
    assert_eq!(outcomes, vec![ReactionOutcome::Skipped]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reactions.load(Ordering::SeqCst), 3);
    assert!(domain.failed_reactions().await.unwrap().is_empty());

    domain.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_reactions_are_recorded_and_retried_on_request() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let broken = Arc::new(AtomicBool::new(true));

    let saga = {
        let attempts = attempts.clone();
        let broken = broken.clone();
        notifier(move |_| {
            let attempts = attempts.clone();
            let broken = broken.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if broken.load(Ordering::SeqCst) {
                    anyhow::bail!("mail server down");
                }
                Ok(())
            }
        })
    };
    let domain = bank(Backend::in_memory(), Backend::in_memory(), saga, fast_config());
    domain.start().await.unwrap();

    domain.execute(deposit("acc-1", 10)).await.unwrap();

    let failures = {
        let watched = domain.clone();
        wait_until("a recorded failure", move || {
            let domain = watched.clone();
            async move { domain.failed_reactions().await.unwrap().len() == 1 }
        })
        .await;
        domain.failed_reactions().await.unwrap()
    };
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(failures[0].saga_key, "notifier/acc-1");
    assert_eq!(failures[0].saga_id, "acc-1");
    assert_eq!(failures[0].errors.len(), 5);
    assert!(failures[0].errors[0].contains("mail server down"));

    // 失败不阻塞后续记录
    domain.execute(deposit("acc-1", 1)).await.unwrap();
    wait_until("the next record", || ready(attempts.load(Ordering::SeqCst) >= 10)).await;

    // 重试请求只尝试一次
    let record = failures[0].record.clone();
    broken.store(false, Ordering::SeqCst);
    let before = attempts.load(Ordering::SeqCst);
    domain.retry_reaction("notifier", &record).await.unwrap();

    wait_until("the retry", || {
        ready(attempts.load(Ordering::SeqCst) == before + 1)
    })
    .await;

    {
        let domain = domain.clone();
        wait_until("the first failure to clear", move || {
            let domain = domain.clone();
            let sequence = record.sequence;
            async move {
                domain
                    .failed_reactions()
                    .await
                    .unwrap()
                    .iter()
                    .all(|failure| failure.record.sequence != sequence)
            }
        })
        .await;
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), before + 1);

    domain.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_react_at_most_once() {
    let reactions = Arc::new(AtomicUsize::new(0));
    let slow = {
        let reactions = reactions.clone();
        notifier(move |_| {
            let reactions = reactions.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                reactions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    // 两个进程共享主日志与元领域后端
    let backend = Backend::in_memory();
    let meta_backend = Backend::in_memory();
    let left = bank(backend.clone(), meta_backend.clone(), slow.clone(), fast_config());
    let right = bank(backend, meta_backend, slow, fast_config());

    let records = left.execute(deposit("acc-1", 10)).await.unwrap();
    let record = &records[0];

    let (a, b) = tokio::join!(left.react_to(record), right.react_to(record));
    let (a, b) = (a.unwrap(), b.unwrap());
    let reacted = vec![ReactionOutcome::Reacted { attempts: 1 }];

    assert_eq!(reactions.load(Ordering::SeqCst), 1);
    assert!((a == reacted) != (b == reacted));

    // 处理过该记录的进程再次收到时直接跳过
    let winner = if a == reacted { &left } else { &right };
    assert_eq!(winner.react_to(record).await.unwrap(), vec![ReactionOutcome::Skipped]);
    assert_eq!(reactions.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_domains_resume_after_processed_records() {
    let backend = Backend::in_memory();
    let meta_backend = Backend::in_memory();

    let before = Arc::new(AtomicUsize::new(0));
    let domain = bank(
        backend.clone(),
        meta_backend.clone(),
        counting(&before),
        fast_config(),
    );
    domain.start().await.unwrap();
    domain.execute(deposit("acc-1", 1)).await.unwrap();
    domain.execute(deposit("acc-1", 2)).await.unwrap();
    wait_until("two reactions", || ready(before.load(Ordering::SeqCst) == 2)).await;
    domain.stop().await;
    drop(domain);

    let after = Arc::new(AtomicUsize::new(0));
    let domain = bank(backend, meta_backend, counting(&after), fast_config());
    domain.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(after.load(Ordering::SeqCst), 0);

    domain.execute(deposit("acc-1", 3)).await.unwrap();
    wait_until("the new record", || ready(after.load(Ordering::SeqCst) == 1)).await;
    assert_eq!(before.load(Ordering::SeqCst), 2);

    domain.stop().await;
}
