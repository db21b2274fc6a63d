use std::collections::HashMap;

use xqueue::blocking::Endpoint;
use xqueue::{Queue, QueueError};

#[test]
fn open_rejects_malformed_ids() {
    for id in ["", "three", "-4"] {
        let err = unsafe { Endpoint::open(id) }.err();
        assert!(
            matches!(err, Some(QueueError::BadId(_))),
            "id {id:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn requests_are_answered_in_order() {
    let (mut queue, peer) = Queue::pair().unwrap();
    let mut endpoint = Endpoint::from_owned_fd(peer.into());

    let worker = std::thread::spawn(move || {
        let mut seen = 0u32;
        loop {
            let args: HashMap<String, String> = match endpoint.recv() {
                Ok(args) => args,
                Err(QueueError::Closed) => return seen,
                Err(err) => panic!("unexpected queue error: {err}"),
            };
            seen += 1;
            endpoint.send(&args["n"]).unwrap();
        }
    });

    for n in 0..16 {
        let mut args = HashMap::new();
        args.insert("n".to_owned(), n.to_string());
        queue.send(&args).await.unwrap();
        let echoed: String = queue.recv().await.unwrap();
        assert_eq!(echoed, n.to_string());
    }
    drop(queue);
    assert_eq!(worker.join().unwrap(), 16);
}
