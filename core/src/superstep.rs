//! The superstep transition.

use tracing::{debug, debug_span};

use crate::api::Core;
use crate::handshake::halt;
use crate::request::{Reply, Request};
use crate::sync::Ordering;

impl Core {
    /// Ends the current superstep. Must be called by every core exactly
    /// once per superstep.
    ///
    /// Three barriers split the transition: gets are resolved between the
    /// first and second, get results and puts are applied between the
    /// second and third. A get therefore never sees a put of the same
    /// superstep, from any core.
    pub fn sync(&mut self) {
        let span = debug_span!("sync", pid = self.pid, superstep = self.superstep);
        let _enter = span.enter();

        // 1. Every request of this superstep has been posted
        self.barrier();
        let requests = self.shared.requests[self.pid].lock().take();
        if self.shared.config().check_registration && self.shared.reg_dirty.load(Ordering::Acquire) {
            self.check_registration();
        }

        // 2. Serve gets from our memory as it stood before any put
        self.resolve_gets(&requests);

        // 3. No put lands before every core resolved its gets
        self.barrier();

        // 4. Get results, then puts in insertion order
        let replies = std::mem::take(&mut *self.shared.replies[self.pid].lock());
        self.apply_replies(replies);
        self.apply_puts(requests);

        // 5. Rotate the message queues
        self.shared.queues[self.pid][self.queue_index].lock().clear();
        self.queue_index ^= 1;
        self.read_cursor = 0;

        // 6. Registration bookkeeping, once per superstep system-wide
        if self.pid == 0 && self.shared.reg_dirty.swap(false, Ordering::AcqRel) {
            self.shared.advance_registration_counter();
        }
        if self.registry.is_dirty() {
            self.registry.commit();
        }

        // 7. Tag size change takes effect
        self.tagsize = self.tagsize_next;

        // 8. Release everyone into the next superstep together
        self.barrier();
        self.superstep += 1;
        debug!("superstep complete");
    }

    fn barrier(&self) {
        if self.shared.barrier.wait(self.shared.abort_flag()).is_err() {
            debug!(pid = self.pid, "abort raised elsewhere, halting");
            halt();
        }
    }

    fn check_registration(&self) {
        let mine = self.registry.calls();
        let reference = self.shared.reg_calls[0].load(Ordering::Acquire);
        if mine != reference {
            self.abort(format_args!(
                "registration mismatch: core {} made {} register/deregister calls, core 0 made {}",
                self.pid, mine, reference
            ));
        }
    }

    fn resolve_gets(&self, requests: &[Request]) {
        for request in requests {
            let Request::Get { requester, src, src_offset, dst, dst_offset, len } = request else {
                continue;
            };
            let bytes = match self.registry.remote(*src, *src_offset, *len) {
                Ok(bytes) => bytes.to_vec(),
                Err(err) => self.abort(format_args!(
                    "get by core {requester} from core {}: {err}",
                    self.pid
                )),
            };
            self.shared.replies[*requester].lock().push(Reply {
                dst: *dst,
                offset: *dst_offset,
                bytes,
            });
        }
    }

    fn apply_replies(&mut self, replies: Vec<Reply>) {
        for reply in replies {
            match self.registry.local_span_mut(reply.dst, reply.offset, reply.bytes.len()) {
                Ok(target) => target.copy_from_slice(&reply.bytes),
                Err(err) => self.abort(format_args!("get result on core {}: {err}", self.pid)),
            }
        }
    }

    fn apply_puts(&mut self, requests: Vec<Request>) {
        for request in requests {
            let Request::Put { dst, offset, payload } = request else {
                continue;
            };
            match self.registry.remote_mut(dst, offset, payload.len()) {
                Ok(target) => target.copy_from_slice(&payload),
                Err(err) => self.abort(format_args!("put into core {}: {err}", self.pid)),
            }
        }
    }
}
