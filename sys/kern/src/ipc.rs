// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inter-task message passing: the endpoint pool and the send/receive
//! protocol.
//!
//! An endpoint is a single-slot mailbox shared by a pair of tasks. It is
//! allocated from a bounded global pool on the first send between a pair
//! and stays bound to that pair; the in-flight direction is recorded in
//! the endpoint itself. Tasks refer to endpoints by pool index through
//! their per-peer reference tables, and both ends of a bound pair always
//! name the same entry.

use abi::{
    SyscallReturn, TaskId, TaskMode, TaskState, MAX_IPC_ENDPOINTS,
    MAX_IPC_MSG,
};

use crate::err::SysError;
use crate::perm;
use crate::softirq;
use crate::state::KernelState;
use crate::task::{
    check_task_id, task_id_from_arg, ArchState, EndpointIdx, NextTask,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EndpointState {
    /// Unallocated pool entry.
    Free,
    /// Bound to a pair and empty; ready for message passing.
    Ready,
    /// Holds an undelivered message for `to`.
    WaitForReceiver,
}

pub struct Endpoint {
    pub(crate) from: TaskId,
    pub(crate) to: TaskId,
    pub(crate) state: EndpointState,
    pub(crate) data: [u8; MAX_IPC_MSG],
    /// Current payload length; at most `MAX_IPC_MSG`, zero unless a
    /// message is in flight.
    pub(crate) size: usize,
}

impl Endpoint {
    fn reset(&mut self) {
        self.from = TaskId::UNUSED;
        self.to = TaskId::UNUSED;
        self.state = EndpointState::Free;
        self.size = 0;
        self.data = [0; MAX_IPC_MSG];
    }
}

/// The global endpoint pool. No per-pair linkage is stored here; the
/// binding lives in both peers' reference tables.
pub struct EndpointPool {
    endpoints: [Endpoint; MAX_IPC_ENDPOINTS],
}

impl EndpointPool {
    pub fn new() -> Self {
        Self {
            endpoints: core::array::from_fn(|_| Endpoint {
                from: TaskId::UNUSED,
                to: TaskId::UNUSED,
                state: EndpointState::Free,
                data: [0; MAX_IPC_MSG],
                size: 0,
            }),
        }
    }

    /// Claims a free entry, marking it `Ready`.
    pub fn acquire(&mut self) -> Option<EndpointIdx> {
        for (i, ep) in self.endpoints.iter_mut().enumerate() {
            if ep.state == EndpointState::Free {
                ep.state = EndpointState::Ready;
                return Some(EndpointIdx(i as u8));
            }
        }
        None
    }

    /// Returns an entry to the pool, zeroing its payload.
    pub fn release(&mut self, idx: EndpointIdx) {
        self.endpoints[usize::from(idx.0)].reset();
    }

    pub fn get(&self, idx: EndpointIdx) -> &Endpoint {
        &self.endpoints[usize::from(idx.0)]
    }

    pub fn get_mut(&mut self, idx: EndpointIdx) -> &mut Endpoint {
        &mut self.endpoints[usize::from(idx.0)]
    }

    /// Number of entries currently allocated, for invariant checks.
    pub fn allocated(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|ep| ep.state != EndpointState::Free)
            .count()
    }
}

/// Implementation of the IPC SEND operation, both variants.
///
/// `caller` is a valid task index (i.e. not directly from user code).
pub(crate) fn send(
    k: &mut KernelState,
    caller: usize,
    blocking: bool,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    // IPC is a main-thread affair; ISR handlers share the kernel stack
    // and cannot park.
    if mode == TaskMode::Isr {
        return Err(SysError::Denied);
    }
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }

    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_ipc_args();
    let peer = args.peer()?;
    let len = args.send_len();
    let buf = args.send_buffer()?;

    // The payload may live in RAM or in rodata. A zero-length payload is
    // a bare notification and carries no pointer to check.
    if len > 0 && !k.tasks[caller].can_access_any(&buf) {
        return Err(SysError::Inval);
    }

    let peer_idx = check_task_id(&k.tasks, peer)?;
    if peer == caller_id {
        return Err(SysError::Inval);
    }
    if len > MAX_IPC_MSG {
        return Err(SysError::Inval);
    }

    #[cfg(feature = "domains")]
    if !perm::same_domain(&k.tasks, caller_id, peer) {
        return Err(SysError::Denied);
    }
    if !perm::ipc_granted(k.image, caller_id, peer) {
        return Err(SysError::Denied);
    }

    // Bind an endpoint for the pair, or reuse the existing one.
    let ep_idx = match k.tasks[caller].endpoint_for(peer) {
        Some(idx) => idx,
        None => {
            if k.tasks[peer_idx].endpoint_for(caller_id).is_some() {
                // The binding must be symmetric; one-sided bindings mean
                // the tables are corrupt.
                crate::fail::die("ipc: endpoint already bound by receiver");
            }
            let idx = k.endpoints.acquire().ok_or(SysError::Busy)?;
            k.tasks[caller].bind_endpoint(peer, idx);
            k.tasks[peer_idx].bind_endpoint(caller_id, idx);
            idx
        }
    };

    // Wake up idle receivers. Deep sleepers stay down.
    let mut hint = NextTask::Same;
    if crate::sleep::is_sleeping(k, peer) {
        if crate::sleep::try_waking_up(k, peer) {
            hint = NextTask::Other;
        }
    } else if k.tasks[peer_idx].state(TaskMode::Main) == TaskState::Idle {
        k.tasks[peer_idx].set_state(TaskMode::Main, TaskState::Runnable);
        hint = NextTask::Other;
    }

    // The receiver still has an unread message in this direction.
    {
        let ep = k.endpoints.get(ep_idx);
        if ep.state == EndpointState::WaitForReceiver && ep.to == peer {
            if blocking {
                k.tasks[caller]
                    .set_state(TaskMode::Main, TaskState::IpcSendBlocked);
                #[cfg(feature = "fipc")]
                k.tasks[peer_idx].set_forced_if_eligible();
                return Ok(NextTask::Other);
            } else {
                return Err(SysError::Busy);
            }
        }
        if ep.state != EndpointState::Ready {
            crate::fail::die("ipc: endpoint not ready for send");
        }
    }

    // Deposit the message. The copy runs in handler mode with interrupts
    // masked, so nobody can observe the payload half-written.
    if len > 0 {
        let src = k.tasks[caller].try_read(&buf)?;
        let ep = k.endpoints.get_mut(ep_idx);
        ep.data[..len].copy_from_slice(src);
    }
    let ep = k.endpoints.get_mut(ep_idx);
    ep.from = caller_id;
    ep.to = peer;
    ep.size = len;
    ep.state = EndpointState::WaitForReceiver;

    // A receiver blocked in recv gets reinjected through the deferred
    // path so its syscall completes normally.
    if k.tasks[peer_idx].state(TaskMode::Main) == TaskState::IpcRecvBlocked {
        softirq::defer_syscall(k, peer_idx);
        hint = NextTask::Other;
    }

    if blocking {
        k.tasks[caller].set_state(TaskMode::Main, TaskState::IpcWaitAck);
        #[cfg(feature = "fipc")]
        k.tasks[peer_idx].set_forced_if_eligible();
        Ok(NextTask::Other)
    } else {
        crate::syscalls::finish(
            &mut k.tasks[caller],
            mode,
            SyscallReturn::Done,
        );
        Ok(hint)
    }
}

/// Implementation of the IPC RECV operation, both variants, including
/// wildcard receive.
///
/// `caller` is a valid task index (i.e. not directly from user code).
pub(crate) fn recv(
    k: &mut KernelState,
    caller: usize,
    blocking: bool,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if mode == TaskMode::Isr {
        return Err(SysError::Denied);
    }
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }

    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_ipc_args();
    let sender_ptr = args.sender_ptr()?;
    let mut sender_ptr_w = sender_ptr.clone();
    let size_ptr = args.size_ptr()?;
    let mut size_ptr_w = size_ptr.clone();

    let requested_word = k.tasks[caller].try_read_ram(&sender_ptr)?[0];
    let capacity =
        k.tasks[caller].try_read_ram(&size_ptr)?[0] as usize;
    let buf = args.recv_buffer(capacity)?;

    let requested = task_id_from_arg(requested_word as usize)?;
    if !requested.is_any_app() {
        check_task_id(&k.tasks, requested)?;
        if requested == caller_id {
            return Err(SysError::Inval);
        }

        #[cfg(feature = "domains")]
        if !perm::same_domain(&k.tasks, requested, caller_id) {
            return Err(SysError::Denied);
        }
        if !perm::ipc_granted(k.image, requested, caller_id) {
            return Err(SysError::Denied);
        }
    }

    // The receive buffer must be writable task RAM. A zero capacity is
    // legal; the caller is then only willing to take a notification.
    if capacity > 0 && !k.tasks[caller].can_access_ram(&buf) {
        return Err(SysError::Inval);
    }

    // Look for a pending message addressed to us: a single binding when a
    // specific peer is named, else the first across the app id space.
    let pending = |k: &KernelState, peer: TaskId| -> Option<EndpointIdx> {
        k.tasks[caller].endpoint_for(peer).filter(|&idx| {
            let ep = k.endpoints.get(idx);
            ep.state == EndpointState::WaitForReceiver && ep.to == caller_id
        })
    };
    let found = if requested.is_any_app() {
        TaskId::all_apps().find_map(|peer| pending(k, peer))
    } else {
        pending(k, requested)
    };

    let ep_idx = match found {
        Some(idx) => idx,
        None => {
            // Nothing to read. Wake an idle named sender so it gets a
            // chance to produce something.
            if !requested.is_any_app()
                && k.tasks[requested.index()].state(TaskMode::Main)
                    == TaskState::Idle
            {
                k.tasks[requested.index()]
                    .set_state(TaskMode::Main, TaskState::Runnable);
            }
            if blocking {
                k.tasks[caller]
                    .set_state(TaskMode::Main, TaskState::IpcRecvBlocked);
                return Ok(NextTask::Other);
            } else {
                return Err(SysError::Busy);
            }
        }
    };

    // On wildcard receive the permission was checked against nobody in
    // particular; re-check against the sender that actually shows up.
    if requested.is_any_app() {
        let from = k.endpoints.get(ep_idx).from;
        if !perm::ipc_granted(k.image, from, caller_id) {
            // Deny the sender and drop its message so the next wildcard
            // receive doesn't trip over it again.
            let ep = k.endpoints.get_mut(ep_idx);
            ep.state = EndpointState::Ready;
            ep.size = 0;
            let s = &mut k.tasks[from.index()];
            s.save_mut(TaskMode::Main).set_return(SyscallReturn::Denied);
            s.set_state(TaskMode::Main, TaskState::Runnable);

            if blocking {
                k.tasks[caller]
                    .set_state(TaskMode::Main, TaskState::IpcRecvBlocked);
                return Ok(NextTask::Other);
            } else {
                return Err(SysError::Busy);
            }
        }
    }

    let from = k.endpoints.get(ep_idx).from;
    let msg_len = k.endpoints.get(ep_idx).size;
    if k.tasks[from.index()].state(TaskMode::Main) == TaskState::Empty {
        crate::fail::die("ipc: message from an empty task");
    }

    // Receiver's buffer is too small: report the required size. Whether
    // the message survives for a retry is a build-time policy; draining
    // it (the default) also releases the sender.
    if msg_len > capacity {
        let out = k.tasks[caller].try_write(&mut size_ptr_w)?;
        out[0] = msg_len as u32;

        if !cfg!(feature = "ipc-retain-on-overflow") {
            let ep = k.endpoints.get_mut(ep_idx);
            ep.state = EndpointState::Ready;
            ep.size = 0;
            unblock_sender(k, from);
        }
        return Err(SysError::Inval);
    }

    // Copy the payload out and return the mailbox to service.
    if msg_len > 0 {
        let mut buf = buf;
        let dst = k.tasks[caller].try_write(&mut buf)?;
        let ep = k.endpoints.get(ep_idx);
        dst[..msg_len].copy_from_slice(&ep.data[..msg_len]);
    }
    let out = k.tasks[caller].try_write(&mut size_ptr_w)?;
    out[0] = msg_len as u32;
    let out = k.tasks[caller].try_write(&mut sender_ptr_w)?;
    out[0] = u32::from(from.0);

    let ep = k.endpoints.get_mut(ep_idx);
    ep.state = EndpointState::Ready;
    ep.size = 0;

    unblock_sender(k, from);

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Other)
}

/// Releases a sender whose message has been consumed. A sender blocked
/// waiting for the acknowledgement resumes with `Done`; one still waiting
/// for mailbox space is reinjected through the deferred path so its send
/// re-executes against the now-empty mailbox.
fn unblock_sender(k: &mut KernelState, sender: TaskId) {
    let idx = sender.index();
    match k.tasks[idx].state(TaskMode::Main) {
        TaskState::IpcWaitAck => {
            let t = &mut k.tasks[idx];
            t.save_mut(TaskMode::Main).set_return(SyscallReturn::Done);
            t.set_state(TaskMode::Main, TaskState::Runnable);
        }
        TaskState::IpcSendBlocked => {
            softirq::defer_syscall(k, idx);
        }
        _ => {}
    }
}
