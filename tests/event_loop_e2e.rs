//! Event loop end-to-end tests: dispatch ordering, timers, cross-thread
//! submission, and socket echo over loopback.

use evio::test_utils::init_test_logging;
use evio::{EventLoop, Interest, SocketFlags, TcpSocket};
use std::cell::{Cell, RefCell};
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn spin(ev: &EventLoop, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() && Instant::now() < deadline {
        ev.run_once(Some(Duration::from_millis(50))).unwrap();
    }
    assert!(done(), "condition not reached before deadline");
}

#[test]
fn timer_firing_order_is_by_deadline() {
    init_test_logging();
    evio::test_phase!("timer_firing_order_is_by_deadline");
    let ev = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    // Armed as A, B, C but due as B, C, A.
    for (delay_ms, tag) in [(50u64, 'A'), (10, 'B'), (30, 'C')] {
        let order = Rc::clone(&order);
        ev.schedule_timer(Duration::from_millis(delay_ms), move || {
            order.borrow_mut().push(tag);
        });
    }
    spin(&ev, || order.borrow().len() == 3);
    assert_eq!(*order.borrow(), vec!['B', 'C', 'A']);
    evio::test_complete!("timer_firing_order_is_by_deadline");
}

#[test]
fn cross_thread_increments_all_arrive() {
    init_test_logging();
    evio::test_phase!("cross_thread_increments_all_arrive");
    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let counter = Arc::new(AtomicU64::new(0));

    let submitter = {
        let handle = handle.clone();
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
            assert!(!handle.is_in_loop_thread());
            for _ in 0..1000 {
                let counter = Arc::clone(&counter);
                // Foreign thread: enqueues and wakes the loop.
                handle.run_in_loop(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        })
    };

    spin(&ev, || counter.load(Ordering::Relaxed) == 1000);
    submitter.join().unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 1000);
    evio::test_complete!("cross_thread_increments_all_arrive");
}

#[test]
fn run_in_loop_is_synchronous_on_owner_thread() {
    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let hit = Arc::new(AtomicU64::new(0));
    let hit_task = Arc::clone(&hit);
    handle.run_in_loop(move || {
        hit_task.fetch_add(1, Ordering::Relaxed);
    });
    // Owner thread: already executed, no loop iteration needed.
    assert_eq!(hit.load(Ordering::Relaxed), 1);
}

#[test]
fn run_in_loop_sync_returns_value_from_foreign_thread() {
    init_test_logging();
    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();

    let waiter = std::thread::spawn(move || handle.run_in_loop_sync(|| 6 * 7).unwrap());
    let ev_handle = ev.handle();
    spin(&ev, || waiter.is_finished() || ev_handle.is_stopped());
    assert_eq!(waiter.join().unwrap(), 42);
}

#[test]
fn deferred_tasks_run_before_io_and_timers() {
    init_test_logging();
    let ev = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    // A due timer, a ready descriptor, and a queued task in one iteration.
    let (reader, writer) = std::os::unix::net::UnixStream::pair().unwrap();
    reader.set_nonblocking(true).unwrap();
    use std::io::Write;
    (&writer).write_all(b"x").unwrap();

    let order_t = Rc::clone(&order);
    ev.schedule_timer(Duration::ZERO, move || order_t.borrow_mut().push("timer"));
    let order_io = Rc::clone(&order);
    ev.register_fd(reader.as_raw_fd(), Interest::readable(), move |_| {
        order_io.borrow_mut().push("io");
    })
    .unwrap();
    let order_task = Rc::clone(&order);
    ev.queue_in_loop(move || order_task.borrow_mut().push("task"));

    spin(&ev, || order.borrow().len() >= 3);
    assert_eq!(order.borrow()[0], "task");
    assert_eq!(order.borrow()[1], "io");
    assert_eq!(order.borrow()[2], "timer");
    ev.unregister_fd(reader.as_raw_fd()).unwrap();
}

#[test]
fn stop_from_foreign_thread_exits_run() {
    init_test_logging();
    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
    });
    let start = Instant::now();
    ev.run(None).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    stopper.join().unwrap();
}

#[test]
fn tcp_echo_over_loopback() {
    init_test_logging();
    evio::test_phase!("tcp_echo_over_loopback");
    let ev = EventLoop::new().unwrap();

    // Nonblocking acceptor driven by the same loop.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_socks: Rc<RefCell<Vec<TcpSocket>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let ev_accept = ev.clone();
        let server_socks = Rc::clone(&server_socks);
        ev.register_fd(listener.as_raw_fd(), Interest::readable(), move |_| {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let sock = TcpSocket::new(&ev_accept);
            sock.attach_stream(stream, SocketFlags::NONE).unwrap();
            let idx = server_socks.borrow().len();
            let socks_cb = Rc::clone(&server_socks);
            sock.set_read_callback(move || {
                let socks = socks_cb.borrow();
                let sock = &socks[idx];
                let mut buf = [0u8; 1024];
                while let Ok(n) = sock.recv(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    let _ = sock.send(&buf[..n]);
                }
            });
            server_socks.borrow_mut().push(sock);
        })
        .unwrap();
    }

    let client = TcpSocket::new(&ev);
    let connected = Rc::new(Cell::new(false));
    let connected_cb = Rc::clone(&connected);
    client
        .connect(
            "127.0.0.1",
            port,
            move |result| {
                result.unwrap();
                connected_cb.set(true);
            },
            SocketFlags::NONE,
            Some(Duration::from_secs(5)),
        )
        .unwrap();
    spin(&ev, || connected.get());

    assert_eq!(client.state(), evio::SocketState::Open);

    // Client read callback drains into a shared buffer.
    let echoed = Rc::new(RefCell::new(Vec::new()));
    let client = Rc::new(client);
    let echoed_cb = Rc::clone(&echoed);
    let client_cb = Rc::clone(&client);
    client.set_read_callback(move || {
        let mut buf = [0u8; 1024];
        while let Ok(n) = client_cb.recv(&mut buf) {
            if n == 0 {
                break;
            }
            echoed_cb.borrow_mut().extend_from_slice(&buf[..n]);
        }
    });

    assert!(client.send(b"hello").unwrap() > 0);
    spin(&ev, || echoed.borrow().len() >= 5);
    assert_eq!(echoed.borrow().as_slice(), b"hello");

    client.close();
    assert_eq!(client.state(), evio::SocketState::Closed);
    evio::test_complete!("tcp_echo_over_loopback");
}
