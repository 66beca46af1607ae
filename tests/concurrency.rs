use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::thread;
use panic_control::disable_hook_in_current_thread;
use polydbm::{
    AsyncDbm, Dbm, NaiveThreadPool, OpenOptions, RecordState, Result, SharedQueueThreadPool,
    StatusCode, ThreadPool,
};
use tempfile::TempDir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(path: &std::path::Path, params: &[(&str, &str)]) -> Result<Dbm> {
    let mut dbm = Dbm::new();
    dbm.open(path, true, &OpenOptions::from_params(params.iter().copied())?)?;
    Ok(dbm)
}

#[test]
fn increments_are_not_lost() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    for (name, params) in [
        ("casket.tkh", vec![("num_buckets", "16")]),
        ("casket.tkt", vec![("max_page_size", "256")]),
        ("casket", vec![("dbm", "baby"), ("num_shards", "3")]),
    ] {
        let dbm = open(&dir.path().join(name), &params)?;
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for i in 0..250 {
                        dbm.increment(format!("counter{}", i % 5), 1, 0).unwrap();
                    }
                });
            }
        })
        .unwrap();
        for i in 0..5 {
            assert_eq!(400, dbm.increment(format!("counter{}", i), i64::MIN, 0)?);
        }
    }
    Ok(())
}

#[test]
fn compare_exchange_succeeds_once_per_value() -> Result<()> {
    init();
    let dbm = open(std::path::Path::new(""), &[("dbm", "stdhash"), ("num_shards", "4")])?;
    let winners = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..6 {
            s.spawn(|_| {
                for round in 0..100 {
                    let expected = if round == 0 {
                        RecordState::Absent
                    } else {
                        RecordState::from((round - 1).to_string().as_str())
                    };
                    loop {
                        match dbm.compare_exchange("turn", expected.clone(), round.to_string().as_str()) {
                            Ok(()) => {
                                winners.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(err) => {
                                assert_eq!(err, StatusCode::InfeasibleError);
                                let current = dbm.get("turn").ok();
                                let done = current.is_some_and(|value| {
                                    String::from_utf8_lossy(&value).parse::<i32>().unwrap() >= round
                                });
                                if done {
                                    break;
                                }
                            }
                        }
                    }
                }
            });
        }
    })
    .unwrap();
    assert_eq!(100, winners.load(Ordering::Relaxed));
    assert_eq!(b"99".to_vec(), dbm.get("turn")?);
    Ok(())
}

#[test]
fn multi_key_transfers_keep_the_total() -> Result<()> {
    init();
    let dbm = open(std::path::Path::new(""), &[("dbm", "tiny"), ("num_shards", "2")])?;
    let accounts = ["alice", "bob", "carol", "dave"];
    for account in accounts {
        dbm.set(account, "100", true)?;
    }
    thread::scope(|s| {
        for t in 0..4 {
            let dbm = &dbm;
            s.spawn(move |_| {
                for i in 0..200 {
                    let from = accounts[(t + i) % 4];
                    let to = accounts[(t + i + 1) % 4];
                    loop {
                        let balances = dbm.get_multi(&[from, to]).unwrap();
                        let (a, b) = (&balances[0].1, &balances[1].1);
                        let parse = |v: &[u8]| String::from_utf8_lossy(v).parse::<i64>().unwrap();
                        let expected = [
                            (from, RecordState::from(a.as_slice())),
                            (to, RecordState::from(b.as_slice())),
                        ];
                        let desired = [
                            (from, RecordState::Value((parse(a.as_slice()) - 1).to_string().into_bytes())),
                            (to, RecordState::Value((parse(b.as_slice()) + 1).to_string().into_bytes())),
                        ];
                        match dbm.compare_exchange_multi(&expected, &desired) {
                            Ok(()) => break,
                            Err(err) => assert_eq!(err, StatusCode::InfeasibleError),
                        }
                    }
                }
            });
        }
    })
    .unwrap();
    let mut total = 0;
    for account in accounts {
        total += String::from_utf8(dbm.get(account)?).unwrap().parse::<i64>().unwrap();
    }
    assert_eq!(400, total);
    Ok(())
}

#[test]
fn async_operations_resolve() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let dbm = Arc::new(open(&dir.path().join("casket.tkh"), &[])?);
    let adbm = AsyncDbm::new(Arc::clone(&dbm), 4)?;

    let sets: Vec<_> = (0..100)
        .map(|i| adbm.set(format!("key{:03}", i), format!("value{}", i), true))
        .collect();
    for set in sets {
        assert!(set.wait(Some(Duration::from_secs(10))));
        set.get()?;
    }
    assert_eq!(100, dbm.count()?);
    assert_eq!(b"value7".to_vec(), adbm.get("key007").get()?);
    assert_eq!(
        adbm.get("nothing").get().unwrap_err(),
        StatusCode::NotFoundError
    );
    let found = adbm
        .get_multi(vec![b"key001".to_vec(), b"missing".to_vec()])
        .get()?;
    assert_eq!(vec![(b"key001".to_vec(), b"value1".to_vec())], found);
    adbm.append("key001", "more", ",").get()?;
    assert_eq!(b"value1,more".to_vec(), dbm.get("key001")?);
    adbm.remove("key002").get()?;
    assert_eq!(
        adbm.remove("key002").get().unwrap_err(),
        StatusCode::NotFoundError
    );
    assert_eq!(
        vec![b"key050".to_vec()],
        adbm.search("begin", "key050", 0).get()?
    );
    adbm.synchronize(false, Default::default()).get()?;
    adbm.rebuild(OpenOptions::new()).get()?;
    assert_eq!(99, dbm.count()?);

    let copy = dir.path().join("copy.tkh");
    adbm.copy_file_data(&copy, false).get()?;
    let mut reopened = Dbm::new();
    reopened.open(&copy, false, &OpenOptions::new())?;
    assert_eq!(99, reopened.count()?);
    reopened.close()?;

    adbm.clear().get()?;
    let dbm = adbm.into_inner();
    assert_eq!(0, dbm.count()?);
    Ok(())
}

#[test]
fn async_results_can_be_awaited() -> Result<()> {
    let dbm = Arc::new(open(std::path::Path::new(""), &[])?);
    let adbm = AsyncDbm::new(dbm, 2)?;
    let set = adbm.set("k", "v", true);
    let get = async {
        set.await.unwrap();
        adbm.get("k").await
    };
    let value = block_on(get)?;
    assert_eq!(b"v".to_vec(), value);
    Ok(())
}

/// Polls on the current thread, parking between wake-ups.
fn block_on<F: std::future::Future>(future: F) -> F::Output {
    use std::pin::pin;
    use std::task::{Context, Poll, Wake, Waker};

    struct Unpark(std::thread::Thread);
    impl Wake for Unpark {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    let waker = Waker::from(Arc::new(Unpark(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => std::thread::park_timeout(Duration::from_millis(10)),
        }
    }
}

fn survives_panics<P: ThreadPool>(pool: P) {
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        pool.spawn(|| {
            disable_hook_in_current_thread();
            panic!("task failure");
        });
    }
    for _ in 0..20 {
        let counter = Arc::clone(&counter);
        pool.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    drop(pool);
    assert_eq!(20, counter.load(Ordering::SeqCst));
}

#[test]
fn shared_queue_pool_survives_panics() -> Result<()> {
    survives_panics(SharedQueueThreadPool::new(4)?);
    Ok(())
}

#[test]
fn naive_pool_survives_panics() -> Result<()> {
    survives_panics(NaiveThreadPool::new(4)?);
    Ok(())
}
