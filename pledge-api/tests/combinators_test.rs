use pledge_api::combinators::{all, from_iter, wrap};
use pledge_api::errors::AllError;
use pledge_api::{Promise, PromiseState, Resolved};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;

fn value(v: i32) -> Promise<i32, io::Error> {
    Promise::new(move |resolve, _| {
        resolve.resolve(v);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_builds_pending_promises() {
        let double = wrap(|n: i32| Ok::<_, io::Error>(n * 2));

        let promise = double(21);
        assert_eq!(promise.state(), PromiseState::Pending);

        promise.exec().unwrap();
        assert_eq!(promise.last_result(), Some(42));
    }

    #[test]
    fn test_from_iter_streams_each_item() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let promise = from_iter(vec!["a", "bb", "ccc"], |s: &str| Ok::<_, io::Error>(s.len()));
        promise.then(move |len| sink.lock().unwrap().push(*len));
        promise.exec().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(promise.result(), Some(Resolved::Many(vec![1, 2, 3])));
    }

    #[test]
    fn test_from_iter_stops_at_first_failure() {
        let promise = from_iter(1..=5, |n: i32| {
            if n == 3 {
                Err(io::Error::other("three"))
            } else {
                Ok(n)
            }
        });
        promise.catch(|_| {});
        promise.exec().unwrap();

        assert_eq!(promise.state(), PromiseState::Rejected);
        assert_eq!(promise.result(), Some(Resolved::Many(vec![1, 2])));
    }

    // Results come back in input order regardless of completion order
    #[test]
    fn test_all_collects_in_order() {
        let children = vec![value(1), value(2), value(3)];
        let aggregate = all(&children);

        let runner = thread::spawn(move || aggregate.exec().map(|_| aggregate));
        for child in children.iter().rev() {
            child.exec().unwrap();
        }

        let aggregate = runner.join().unwrap().unwrap();
        assert_eq!(
            aggregate.last_result(),
            Some(vec![Some(1), Some(2), Some(3)])
        );
    }

    #[test]
    fn test_all_rejects_on_child_rejection() {
        let failing: Promise<i32, io::Error> = Promise::builder(|_, _| Err(io::Error::other("child")))
            .catch(|_| {})
            .build();
        let children = vec![value(1), failing.clone()];
        let aggregate = all(&children);
        aggregate.catch(|_| {});

        for child in &children {
            child.exec().unwrap();
        }
        aggregate.exec().unwrap();

        assert_eq!(aggregate.state(), PromiseState::Rejected);
        let error = aggregate.error().unwrap();
        assert!(matches!(&*error, AllError::Rejected { id, .. } if *id == failing.id()));
    }

    // Children that completed before `all` count immediately
    #[test]
    fn test_all_with_completed_children() {
        let child = value(9);
        child.exec().unwrap();

        let aggregate = all(std::slice::from_ref(&child));
        aggregate.exec().unwrap();
        assert_eq!(aggregate.last_result(), Some(vec![Some(9)]));
    }

    #[test]
    fn test_all_abandoned_when_children_dropped() {
        let children = vec![value(1), value(2)];
        let aggregate = all(&children);
        aggregate.catch(|_| {});
        drop(children);

        aggregate.exec().unwrap();
        let error = aggregate.error().unwrap();
        assert!(matches!(&*error, AllError::Abandoned { remaining: 2 }));
    }

    // A child canceled before it ran will never complete
    #[test]
    fn test_all_abandoned_when_child_canceled() {
        let children = vec![value(1), value(2)];
        let aggregate = all(&children);
        aggregate.catch(|_| {});

        children[0].exec().unwrap();
        children[1].cancel();

        aggregate.exec().unwrap();
        assert_eq!(aggregate.state(), PromiseState::Rejected);
        let error = aggregate.error().unwrap();
        assert!(matches!(&*error, AllError::Abandoned { remaining: 1 }));
        assert_eq!(children[1].state(), PromiseState::Pending);
    }

    // Completing while the aggregate waits is not affected by the poll
    #[test]
    fn test_all_waits_past_poll_interval() {
        let children = vec![value(1), value(2)];
        let aggregate = all(&children);

        let runner = thread::spawn(move || aggregate.exec().map(|_| aggregate));
        thread::sleep(std::time::Duration::from_millis(50));
        for child in &children {
            child.exec().unwrap();
        }

        let aggregate = runner.join().unwrap().unwrap();
        assert_eq!(aggregate.last_result(), Some(vec![Some(1), Some(2)]));
    }
}
