//! Integration tests for the event reactor over real sockets.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use keystone::reactor::{EventLoop, Mask, ProcessFlags, TimerAction};

#[test]
fn test_echo_round_trip() {
    let (server, mut client) = UnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    let fd = server.as_raw_fd();
    let server = Rc::new(RefCell::new(server));
    let pending = Rc::new(RefCell::new(Vec::<u8>::new()));
    let echoed = Rc::new(Cell::new(false));

    let mut event_loop = EventLoop::new(1024).unwrap();

    // Read whatever arrives, then switch on writable interest to echo it.
    let (conn, out, done) = (Rc::clone(&server), Rc::clone(&pending), Rc::clone(&echoed));
    event_loop
        .register_io(fd, Mask::READABLE, move |el, fd, _| {
            let mut buf = [0u8; 64];
            let n = conn.borrow_mut().read(&mut buf)?;
            if n == 0 {
                el.unregister_io(fd, Mask::READABLE | Mask::WRITABLE)?;
                return Ok(());
            }
            out.borrow_mut().extend_from_slice(&buf[..n]);

            let (conn, out, done) = (Rc::clone(&conn), Rc::clone(&out), Rc::clone(&done));
            el.register_io(fd, Mask::WRITABLE, move |el, fd, _| {
                let data: Vec<u8> = out.borrow_mut().drain(..).collect();
                conn.borrow_mut().write_all(&data)?;
                el.unregister_io(fd, Mask::WRITABLE)?;
                done.set(true);
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    client.write_all(b"hello").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !echoed.get() && Instant::now() < deadline {
        event_loop.process_events(ProcessFlags::FILE_EVENTS | ProcessFlags::DONT_WAIT);
    }
    assert!(echoed.get());

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello");
    assert_eq!(event_loop.mask_of(fd), Mask::READABLE);
}

#[test]
fn test_closed_peer_unregisters() {
    let (server, client) = UnixStream::pair().unwrap();
    server.set_nonblocking(true).unwrap();
    let fd = server.as_raw_fd();
    let mut event_loop = EventLoop::new(1024).unwrap();

    let mut conn = server;
    event_loop
        .register_io(fd, Mask::READABLE, move |el, fd, _| {
            let mut buf = [0u8; 16];
            if conn.read(&mut buf)? == 0 {
                el.unregister_io(fd, Mask::READABLE)?;
            }
            Ok(())
        })
        .unwrap();

    drop(client);
    event_loop.process_events(ProcessFlags::FILE_EVENTS | ProcessFlags::DONT_WAIT);
    assert_eq!(event_loop.mask_of(fd), Mask::NONE);
    assert_eq!(event_loop.max_fd(), None);
}

#[test]
fn test_max_fd_tracks_highest_registration() {
    let (a, _a_peer) = UnixStream::pair().unwrap();
    let (b, _b_peer) = UnixStream::pair().unwrap();
    let (low, high) = if a.as_raw_fd() < b.as_raw_fd() {
        (a.as_raw_fd(), b.as_raw_fd())
    } else {
        (b.as_raw_fd(), a.as_raw_fd())
    };
    let mut event_loop = EventLoop::new(1024).unwrap();
    event_loop.register_io(low, Mask::READABLE, |_, _, _| Ok(())).unwrap();
    event_loop.register_io(high, Mask::READABLE, |_, _, _| Ok(())).unwrap();
    assert_eq!(event_loop.max_fd(), Some(high));

    event_loop.unregister_io(high, Mask::READABLE).unwrap();
    assert_eq!(event_loop.max_fd(), Some(low));
}

#[test]
fn test_timers_interleave_with_io() {
    let (a, mut b) = UnixStream::pair().unwrap();
    a.set_nonblocking(true).unwrap();
    let mut event_loop = EventLoop::new(1024).unwrap();
    let reads = Rc::new(Cell::new(0));
    let ticks = Rc::new(Cell::new(0));

    let r = Rc::clone(&reads);
    let mut conn = a;
    let fd = conn.as_raw_fd();
    event_loop
        .register_io(fd, Mask::READABLE, move |_, _, _| {
            let mut buf = [0u8; 16];
            if conn.read(&mut buf)? > 0 {
                r.set(r.get() + 1);
            }
            Ok(())
        })
        .unwrap();

    let t = Rc::clone(&ticks);
    event_loop.register_timer(Duration::from_millis(5), move |_, _| {
        t.set(t.get() + 1);
        TimerAction::Again(Duration::from_millis(5))
    });
    event_loop.register_timer(Duration::from_millis(60), |el, _| {
        el.stop();
        TimerAction::Done
    });

    b.write_all(b"x").unwrap();
    event_loop.run();

    assert_eq!(reads.get(), 1);
    assert!(ticks.get() >= 5, "ticks: {}", ticks.get());
}
