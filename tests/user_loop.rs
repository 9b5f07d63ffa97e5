mod common;

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::{Arc, Mutex};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use common::{serial, MockEngine, DECRYPT_OK, TWO_KEYS};
use pgme::{wait, Data, Direction, Error, IoCallbacks, IoEvent, IoHandle};

#[derive(Default)]
struct State {
    next_tag: u64,
    watched: HashMap<u64, (RawFd, Direction, IoHandle)>,
    events: Vec<String>,
}

/// A minimal application event loop built on `poll`.
#[derive(Default)]
struct PollLoop {
    state: Mutex<State>,
}

impl IoCallbacks for PollLoop {
    fn add(&self, fd: RawFd, dir: Direction, handle: IoHandle) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_tag += 1;
        let tag = state.next_tag;
        state.watched.insert(tag, (fd, dir, handle));
        Ok(tag)
    }

    fn remove(&self, tag: u64) {
        self.state.lock().unwrap().watched.remove(&tag);
    }

    fn event(&self, event: IoEvent<'_>) {
        let name = match event {
            IoEvent::Start => "start".to_owned(),
            IoEvent::NextKey => "next-key".to_owned(),
            IoEvent::Done(Ok(())) => "done".to_owned(),
            IoEvent::Done(Err(e)) => format!("failed: {}", e),
        };
        self.state.lock().unwrap().events.push(name);
    }
}

impl PollLoop {
    fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    fn done(&self) -> bool {
        self.events()
            .last()
            .map_or(false, |e| e == "done" || e.starts_with("failed"))
    }

    /// Polls and dispatches until the operation reports completion.
    fn run(&self) {
        while !self.done() {
            let watched: Vec<(u64, RawFd, Direction)> = {
                let state = self.state.lock().unwrap();
                state
                    .watched
                    .iter()
                    .map(|(&tag, &(fd, dir, _))| (tag, fd, dir))
                    .collect()
            };
            assert!(!watched.is_empty(), "nothing to watch before completion");

            let ready: Vec<u64> = {
                let mut fds: Vec<PollFd<'_>> = watched
                    .iter()
                    .map(|&(_, fd, dir)| {
                        let events = match dir {
                            Direction::Read => PollFlags::POLLIN,
                            Direction::Write => PollFlags::POLLOUT,
                        };
                        PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, events)
                    })
                    .collect();
                poll(&mut fds, PollTimeout::from(1000u16)).unwrap();
                watched
                    .iter()
                    .zip(&fds)
                    .filter(|(_, p)| p.revents().map_or(false, |r| !r.is_empty()))
                    .map(|(&(tag, _, _), _)| tag)
                    .collect()
            };

            for tag in ready {
                // An earlier handler may have removed this registration.
                let handle = self
                    .state
                    .lock()
                    .unwrap()
                    .watched
                    .get(&tag)
                    .map(|(_, _, handle)| handle.clone());
                if let Some(handle) = handle {
                    handle.run().unwrap();
                }
            }
        }
    }
}

#[test]
fn decrypt_on_the_application_loop() {
    let _guard = serial();
    let engine = MockEngine::new(DECRYPT_OK);
    let ctx = engine.context();
    let io = Arc::new(PollLoop::default());
    ctx.set_io_callbacks(Some(io.clone()));

    let plain = Data::new();
    ctx.decrypt_start(&Data::from_bytes(&b"over the wire"[..]), &plain)
        .unwrap();
    assert_eq!(io.events(), vec!["start"]);
    assert!(matches!(wait(Some(&ctx), false), Err(Error::InvalidValue)));

    io.run();
    assert_eq!(io.events(), vec!["start", "done"]);
    assert!(io.state.lock().unwrap().watched.is_empty());
    assert_eq!(plain.to_vec().unwrap(), b"over the wire");
    assert_eq!(ctx.decrypt_result().unwrap().recipients.len(), 1);
}

#[test]
fn keylist_on_the_application_loop() {
    let _guard = serial();
    let engine = MockEngine::new(TWO_KEYS);
    let ctx = engine.context();
    let io = Arc::new(PollLoop::default());
    ctx.set_io_callbacks(Some(io.clone()));

    ctx.keylist_start(&[], false).unwrap();
    assert!(matches!(ctx.keylist_next(), Err(Error::Pending)));

    io.run();
    let events = io.events();
    assert_eq!(events.iter().filter(|e| *e == "next-key").count(), 2);
    assert_eq!(events.last().map(String::as_str), Some("done"));

    assert!(ctx.keylist_next().unwrap().is_some());
    assert!(ctx.keylist_next().unwrap().is_some());
    assert!(ctx.keylist_next().unwrap().is_none());
}

#[test]
fn engine_failure_is_reported_through_the_done_event() {
    let _guard = serial();
    let engine = MockEngine::new("cat >/dev/null\nexit 2");
    let ctx = engine.context();
    let io = Arc::new(PollLoop::default());
    ctx.set_io_callbacks(Some(io.clone()));

    ctx.decrypt_start(&Data::from_bytes(&b"x"[..]), &Data::new())
        .unwrap();
    io.run();
    let events = io.events();
    // Without DECRYPTION_OKAY the status stream already fails the operation.
    assert_eq!(events.len(), 2);
    assert!(events[1].starts_with("failed"));
}
