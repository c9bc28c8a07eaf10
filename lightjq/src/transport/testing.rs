//! Test suite for ensuring a correct implementation of a transport.
use std::time::Duration;

use super::*;

const WAIT: Duration = Duration::from_millis(200);

/// Create test suite for lightjq transports.
///
/// For transport implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// use lightjq::test_suite;
/// use lightjq::transport::memory::InMemoryTransport;
/// test_suite!(for: InMemoryTransport::new());
/// ```
///
/// If you using a different async test attribute, or need extra attributes on every test, you can
/// configure the macro to use those instead. For example for a transport that needs a running
/// broker:
///
/// ```ignore
/// use lightjq::test_suite;
/// test_suite!(
///     attrs: [tokio::test, ignore = "requires a running broker"],
///     args: (),
///     transport: TransportImplementation::connect(URL).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $transport:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), transport: $transport);
    };
    (attr: $attr:meta, args: $args:tt, transport: $transport:expr) => {
        $crate::test_suite!(@suite [$attr], $args, $transport);
    };
    (attrs: [$($attr:meta),+], args: $args:tt, transport: $transport:expr) => {
        $crate::test_suite!(@suite [$($attr),+], $args, $transport);
    };
    (@suite [$($attr:meta),+], $args:tt, $transport:expr) => {
        $(#[$attr])+
        async fn store_and_load_job $args {
          let transport = $transport;
          $crate::transport::testing::store_and_load_job(transport).await;
        }
        $(#[$attr])+
        async fn load_job_not_found $args {
          let transport = $transport;
          $crate::transport::testing::load_job_not_found(transport).await;
        }
        $(#[$attr])+
        async fn store_job_twice_indexes_once $args {
          let transport = $transport;
          $crate::transport::testing::store_job_twice_indexes_once(transport).await;
        }
        $(#[$attr])+
        async fn pop_ready_job_ids_by_priority $args {
          let transport = $transport;
          $crate::transport::testing::pop_ready_job_ids_by_priority(transport).await;
        }
        $(#[$attr])+
        async fn pop_ready_job_id_times_out_when_empty $args {
          let transport = $transport;
          $crate::transport::testing::pop_ready_job_id_times_out_when_empty(transport).await;
        }
        $(#[$attr])+
        async fn restore_ready_job_id $args {
          let transport = $transport;
          $crate::transport::testing::restore_ready_job_id(transport).await;
        }
        $(#[$attr])+
        async fn restore_keeps_newer_index_entry $args {
          let transport = $transport;
          $crate::transport::testing::restore_keeps_newer_index_entry(transport).await;
        }
        $(#[$attr])+
        async fn pop_ready_job_id_wakes_on_store $args {
          let transport = $transport;
          $crate::transport::testing::pop_ready_job_id_wakes_on_store(transport).await;
        }
        $(#[$attr])+
        async fn take_job_returns_record_once $args {
          let transport = $transport;
          $crate::transport::testing::take_job_returns_record_once(transport).await;
        }
        $(#[$attr])+
        async fn processing_set $args {
          let transport = $transport;
          $crate::transport::testing::processing_set(transport).await;
        }
        $(#[$attr])+
        async fn pop_intake_times_out_when_empty $args {
          let transport = $transport;
          $crate::transport::testing::pop_intake_times_out_when_empty(transport).await;
        }
        $(#[$attr])+
        async fn distribute_and_publish $args {
          let transport = $transport;
          $crate::transport::testing::distribute_and_publish(transport).await;
        }
    };
}

pub use test_suite;

#[doc(hidden)]
pub async fn store_and_load_job(transport: impl Transport) {
    let job = Job::new("job-1", "resize")
        .with_priority(4)
        .with_max_retry(2)
        .with_keep_result(true);

    transport.store_job(&job).await.unwrap();

    let loaded = transport.load_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.priority, 4);
    assert_eq!(loaded.max_retry, 2);
    assert!(loaded.keep_result);
}

#[doc(hidden)]
pub async fn load_job_not_found(transport: impl Transport) {
    let loaded = transport.load_job(&"missing".into()).await.unwrap();
    assert!(loaded.is_none());
}

#[doc(hidden)]
pub async fn store_job_twice_indexes_once(transport: impl Transport) {
    let job = Job::new("job-1", "resize");
    transport.store_job(&job).await.unwrap();
    transport
        .store_job(&job.clone().next_attempt())
        .await
        .unwrap();

    let popped = transport.pop_ready_job_id(WAIT).await.unwrap();
    assert_eq!(popped.map(|ready| ready.id), Some(job.id.clone()));
    assert!(transport.pop_ready_job_id(WAIT).await.unwrap().is_none());

    let loaded = transport.load_job(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.current_retry, 1);
}

#[doc(hidden)]
pub async fn pop_ready_job_ids_by_priority(transport: impl Transport) {
    transport
        .store_job(&Job::new("job-1", "resize").with_priority(5))
        .await
        .unwrap();
    transport
        .store_job(&Job::new("job-2", "resize").with_priority(1))
        .await
        .unwrap();
    transport
        .store_job(&Job::new("job-3", "resize").with_priority(-3))
        .await
        .unwrap();

    let mut popped = Vec::new();
    while let Some(ready) = transport.pop_ready_job_id(WAIT).await.unwrap() {
        popped.push(ready.id);
    }

    assert_eq!(
        popped,
        vec![JobId::from("job-3"), JobId::from("job-2"), JobId::from("job-1")]
    );
}

#[doc(hidden)]
pub async fn pop_ready_job_id_times_out_when_empty(transport: impl Transport) {
    let popped = transport.pop_ready_job_id(WAIT).await.unwrap();
    assert!(popped.is_none());
}

#[doc(hidden)]
pub async fn pop_ready_job_id_wakes_on_store(transport: impl Transport) {
    let handle = tokio::spawn({
        let transport = transport.clone();
        async move { transport.pop_ready_job_id(Duration::from_secs(5)).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    transport
        .store_job(&Job::new("job-1", "resize"))
        .await
        .unwrap();

    let popped = handle.await.unwrap().unwrap();
    assert_eq!(popped.map(|ready| ready.id), Some(JobId::from("job-1")));
}

#[doc(hidden)]
pub async fn restore_ready_job_id(transport: impl Transport) {
    transport
        .store_job(&Job::new("job-1", "resize").with_priority(7))
        .await
        .unwrap();
    transport
        .store_job(&Job::new("job-2", "resize").with_priority(3))
        .await
        .unwrap();

    let popped = transport.pop_ready_job_id(WAIT).await.unwrap().unwrap();
    assert_eq!(popped.id, JobId::from("job-2"));
    assert_eq!(popped.score, 3.0);

    transport.restore_ready_job_id(&popped).await.unwrap();

    let popped = transport.pop_ready_job_id(WAIT).await.unwrap().unwrap();
    assert_eq!(popped, ReadyJobId { id: "job-2".into(), score: 3.0 });
}

#[doc(hidden)]
pub async fn restore_keeps_newer_index_entry(transport: impl Transport) {
    let job = Job::new("job-1", "resize").with_priority(5);
    transport.store_job(&job).await.unwrap();
    let popped = transport.pop_ready_job_id(WAIT).await.unwrap().unwrap();

    transport
        .store_job(&job.clone().with_priority(1))
        .await
        .unwrap();
    transport.restore_ready_job_id(&popped).await.unwrap();

    let popped = transport.pop_ready_job_id(WAIT).await.unwrap().unwrap();
    assert_eq!(popped.score, 1.0);
    assert!(transport.pop_ready_job_id(WAIT).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn take_job_returns_record_once(transport: impl Transport) {
    let job = Job::new("job-1", "resize");
    transport.store_job(&job).await.unwrap();

    let (first, second) = futures::join!(transport.take_job(&job.id), transport.take_job(&job.id));
    let taken = [first.unwrap(), second.unwrap()];

    assert_eq!(taken.iter().filter(|job| job.is_some()).count(), 1);
    assert!(transport.load_job(&job.id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn processing_set(transport: impl Transport) {
    let job_id = JobId::from("job-1");
    assert_eq!(transport.processing_count().await.unwrap(), 0);

    transport.mark_processing(&job_id).await.unwrap();
    transport.mark_processing(&job_id).await.unwrap();
    transport.mark_processing(&"job-2".into()).await.unwrap();
    assert_eq!(transport.processing_count().await.unwrap(), 2);

    assert!(transport.unmark_processing(&job_id).await.unwrap());
    assert!(!transport.unmark_processing(&job_id).await.unwrap());
    assert_eq!(transport.processing_count().await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn pop_intake_times_out_when_empty(transport: impl Transport) {
    for queue in [
        IntakeQueue::WorkerRegistrations,
        IntakeQueue::JobRegistrations,
        IntakeQueue::Results,
    ] {
        let popped = transport.pop_intake(queue, WAIT).await.unwrap();
        assert!(popped.is_none());
    }
}

#[doc(hidden)]
pub async fn distribute_and_publish(transport: impl Transport) {
    transport.distribute_job(&"job-1".into()).await.unwrap();
    transport
        .publish_result(&JobResult::success("job-1", rmpv::Value::Nil))
        .await
        .unwrap();
}
