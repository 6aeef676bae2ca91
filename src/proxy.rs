use log::{debug, trace};

use crate::error::{Error, Result};
use crate::poll::PollFlags;
use crate::socket::{Flags, Socket};

#[derive(Copy, Clone, PartialEq, Eq)]
enum State {
    Active,
    Paused,
    Terminated,
}

/// Forward whole messages between two sockets in both directions
///
/// The classic intermediary: bind a ROUTER and a DEALER, run a proxy
/// between them, and requests fan out to however many workers connect
/// to the back side.  Runs until the context terminates.
///
/// If `capture` is given, every frame moving backend→frontend is also
/// copied there (the request direction is not captured).
pub fn proxy(
    frontend: &mut Socket,
    backend: &mut Socket,
    capture: Option<&mut Socket>,
) -> Result<()> {
    run_proxy(frontend, backend, capture, None)
}

/// [`proxy`] with a control socket steering the loop: a message of
/// `PAUSE` freezes forwarding (messages keep queueing), `RESUME`
/// unfreezes it, and `TERMINATE` makes the proxy return successfully
pub fn proxy_steerable(
    frontend: &mut Socket,
    backend: &mut Socket,
    capture: Option<&mut Socket>,
    control: &mut Socket,
) -> Result<()> {
    run_proxy(frontend, backend, capture, Some(control))
}

fn run_proxy(
    frontend: &mut Socket,
    backend: &mut Socket,
    mut capture: Option<&mut Socket>,
    mut control: Option<&mut Socket>,
) -> Result<()> {
    let mut state = State::Active;

    while state != State::Terminated {
        let front_ready = frontend.events()?;
        let back_ready = backend.events()?;

        let mut worked = false;

        if let Some(ctl) = control.as_deref_mut() {
            if ctl.events()?.contains(PollFlags::IN) {
                state = handle_control(ctl, state)?;
                worked = true;
                if state == State::Terminated {
                    break;
                }
            }
        }

        // A transfer starts only when the source has a message and
        // the destination has room; once started it must run to the
        // final frame, because switching pipes mid-message would
        // corrupt framing
        if state == State::Active
            && front_ready.contains(PollFlags::IN)
            && back_ready.contains(PollFlags::OUT)
        {
            forward(frontend, backend, &mut None)?;
            worked = true;
        }

        if state == State::Active
            && back_ready.contains(PollFlags::IN)
            && front_ready.contains(PollFlags::OUT)
        {
            forward(backend, frontend, &mut capture)?;
            worked = true;
        }

        if !worked {
            wait_for_activity(frontend, backend, control.as_deref())?;
        }
    }

    debug!("proxy terminated by control socket");
    Ok(())
}

// Move one whole message, copying it to the capture socket if any
fn forward(
    source: &mut Socket,
    dest: &mut Socket,
    capture: &mut Option<&mut Socket>,
) -> Result<()> {
    loop {
        let msg = source.recv(Flags::NONE)?;
        let more = source.rcvmore();

        if let Some(cap) = capture.as_deref_mut() {
            cap.send(msg.clone(), Flags::NONE)?;
        }

        dest.send(msg, Flags::NONE)?;
        if !more {
            return Ok(());
        }
    }
}

fn handle_control(control: &mut Socket, state: State) -> Result<State> {
    let mut state = state;
    loop {
        let msg = match control.recv(Flags::DONT_WAIT) {
            Ok(msg) => msg,
            Err(Error::WouldBlock) => return Ok(state),
            Err(e) => return Err(e),
        };
        // Drain any trailing frames so a sloppy controller cannot
        // desynchronize the command stream
        while control.rcvmore() {
            control.recv(Flags::DONT_WAIT)?;
        }
        match msg.data() {
            b"PAUSE" => {
                trace!("proxy paused");
                state = State::Paused;
            }
            b"RESUME" => {
                trace!("proxy resumed");
                state = State::Active;
            }
            b"TERMINATE" => return Ok(State::Terminated),
            other => debug!("ignoring unknown proxy control {:?}", other.len()),
        }
    }
}

// Park on the wakeup descriptors until any of the sockets needs
// another look
fn wait_for_activity(
    frontend: &Socket,
    backend: &Socket,
    control: Option<&Socket>,
) -> Result<()> {
    let mut pollfds = Vec::with_capacity(3);
    for fd in [Some(frontend.fd()), Some(backend.fd()), control.map(|c| c.fd())]
        .into_iter()
        .flatten()
    {
        pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
    if rc == -1 {
        return Err(Error::last_os());
    }
    Ok(())
}
