//! Multi-threaded scheduling scenarios.

use cruise_core::IntegrationRequest;
use cruise_scheduler::{
    ContextState, GatePolicy, IntegrationContext, QueueSettings, ServerHandle, ServerItem,
    StructureConfig,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn ask(project: &Arc<ServerItem>) -> Arc<IntegrationContext> {
    let context = IntegrationContext::new(project, IntegrationRequest::force("test"));
    project.ask_to_integrate(&context).unwrap();
    context
}

/// Waits for admission on a worker thread, logs start/end and completes.
fn run_all(contexts: Vec<Arc<IntegrationContext>>, build: Duration) -> Vec<String> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let workers: Vec<_> = contexts
        .into_iter()
        .map(|context| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                assert!(context.wait(WAIT).unwrap(), "{} never admitted", context.project_name());
                log.lock().unwrap().push(format!("start {}", context.project_name()));
                thread::sleep(build);
                log.lock().unwrap().push(format!("end {}", context.project_name()));
                context.complete().unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    Arc::try_unwrap(log).unwrap().into_inner().unwrap()
}

fn starts(log: &[String]) -> Vec<String> {
    log.iter()
        .filter_map(|line| line.strip_prefix("start "))
        .map(str::to_string)
        .collect()
}

#[test]
fn test_queue_capacity_is_never_exceeded() {
    let projects: Vec<_> = (0..8).map(|i| ServerItem::project(format!("p{i}"))).collect();
    let queue =
        ServerItem::queue_with("q", QueueSettings::with_allowed_active(2), projects.clone())
            .unwrap();

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = projects
        .iter()
        .cloned()
        .map(|project| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let context = ask(&project);
                assert!(context.wait(WAIT).unwrap());
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                context.complete().unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(queue.active_requests().is_empty());
    assert!(queue.pending_requests().is_empty());
}

#[test]
fn test_queue_admits_in_request_order() {
    let projects: Vec<_> = (1..=5).map(|i| ServerItem::project(format!("p{i}"))).collect();
    let _queue = ServerItem::queue("q", projects.clone()).unwrap();

    let contexts: Vec<_> = projects.iter().map(ask).collect();
    let log = run_all(contexts, Duration::from_millis(1));

    assert_eq!(starts(&log), vec!["p1", "p2", "p3", "p4", "p5"]);
}

#[test]
fn test_pipeline_stage_waits_for_whole_gate() {
    let p1 = ServerItem::project("Project1");
    let p2 = ServerItem::project("Project2");
    let p3 = ServerItem::project("Project3");
    let p4 = ServerItem::project("Project4");
    let gate = ServerItem::gate(
        "Gate1",
        GatePolicy::Completion,
        vec![Arc::clone(&p2), Arc::clone(&p3)],
    )
    .unwrap();
    let _pipeline =
        ServerItem::pipeline("pipeline", vec![Arc::clone(&p1), gate, Arc::clone(&p4)]).unwrap();

    let contexts = vec![ask(&p2), ask(&p3), ask(&p4)];
    let log = run_all(contexts, Duration::from_millis(10));

    let position = |line: &str| log.iter().position(|l| l == line).unwrap();
    assert!(position("start Project4") > position("end Project2"));
    assert!(position("start Project4") > position("end Project3"));
}

#[test]
fn test_round_robin_alternates_under_continuous_demand() {
    let left: Vec<_> = (1..=3).map(|i| ServerItem::project(format!("a{i}"))).collect();
    let right: Vec<_> = (1..=3).map(|i| ServerItem::project(format!("b{i}"))).collect();
    let _rr = ServerItem::round_robin(
        "rr",
        1,
        vec![
            ServerItem::queue("q1", left.clone()).unwrap(),
            ServerItem::queue("q2", right.clone()).unwrap(),
        ],
    )
    .unwrap();

    let contexts: Vec<_> = left.iter().chain(right.iter()).map(ask).collect();
    let log = run_all(contexts, Duration::from_millis(1));

    assert_eq!(starts(&log), vec!["a1", "b1", "a2", "b2", "a3", "b3"]);
}

#[test]
fn test_no_lost_wakeups_under_contention() {
    let queue = ServerItem::queue("shared", vec![]).unwrap();
    let admitted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let queue = Arc::clone(&queue);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let project = ServerItem::project(format!("worker{worker}"));
                for _ in 0..25 {
                    let context = IntegrationContext::new(&project, IntegrationRequest::force("t"));
                    queue.ask_to_integrate(&context).unwrap();
                    assert!(context.wait(WAIT).unwrap());
                    admitted.fetch_add(1, Ordering::SeqCst);
                    context.complete().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 200);
    assert!(queue.pending_requests().is_empty());
}

#[test]
fn test_status_never_shows_waiters_beside_a_free_slot() {
    let projects: Vec<_> = (0..4).map(|i| ServerItem::project(format!("p{i}"))).collect();
    let queue = ServerItem::queue("q", projects.clone()).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let observer = {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut torn = 0;
            while !done.load(Ordering::SeqCst) {
                let (active, pending) = queue.request_counts();
                if active == 0 && pending > 0 {
                    torn += 1;
                }
            }
            torn
        })
    };

    let workers: Vec<_> = projects
        .into_iter()
        .map(|project| {
            thread::spawn(move || {
                for _ in 0..20 {
                    let context = ask(&project);
                    assert!(context.wait(WAIT).unwrap());
                    context.complete().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);

    assert_eq!(observer.join().unwrap(), 0);
}

#[test]
fn test_reload_wakes_pending_waiters() {
    let yaml = r#"
items:
  - type: project
    name: a
  - type: project
    name: b
  - type: queue
    name: q
    children: [a, b]
"#;
    let config = StructureConfig::from_yaml(yaml).unwrap();
    let handle = ServerHandle::new(config.build().unwrap());

    let tree = handle.current();
    let running = ask(&tree.project("a").unwrap());
    let waiting = ask(&tree.project("b").unwrap());
    drop(tree);

    let waiter = {
        let waiting = Arc::clone(&waiting);
        thread::spawn(move || waiting.wait(WAIT).unwrap())
    };
    thread::sleep(Duration::from_millis(20));

    assert_eq!(handle.reload(config.build().unwrap()), 1);
    assert!(!waiter.join().unwrap());
    assert_eq!(waiting.state(), ContextState::Cancelled);

    running.complete().unwrap();
    let next = ask(&handle.current().project("b").unwrap());
    assert_eq!(next.state(), ContextState::Admitted);
}
