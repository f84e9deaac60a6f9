use sqljob_protocol::Response;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Dispatcher is the table of requests which are awaiting their response.
///
/// Each pending request has a single-use resolver, keyed by its correlation id.
/// Responses may arrive in any order. Once the Dispatcher is flushed every
/// resolver is fulfilled with a synthetic failure, and no further requests
/// may be registered.
#[derive(Default)]
pub(crate) struct Dispatcher {
    // Non-async lock which *cannot* be held across an await point.
    pending: std::sync::Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    resolvers: HashMap<String, oneshot::Sender<Response>>,
    flushed: bool,
}

impl Dispatcher {
    /// Register a resolver for request `id`, returning the receiver
    /// of its eventual Response.
    pub fn register(&self, id: &str) -> crate::Result<oneshot::Receiver<Response>> {
        let mut pending = self.pending.lock().unwrap();

        if pending.flushed {
            return Err(crate::Error::JobEnded);
        } else if pending.resolvers.contains_key(id) {
            return Err(crate::Error::DuplicateId(id.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        pending.resolvers.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Discard the resolver of request `id`, as when it could not be written.
    pub fn forget(&self, id: &str) {
        self.pending.lock().unwrap().resolvers.remove(id);
    }

    /// Fulfill the resolver matching `response`. Responses having
    /// an id which isn't pending are ignored.
    pub fn dispatch(&self, response: Response) {
        let resolver = self.pending.lock().unwrap().resolvers.remove(&response.id);

        match resolver {
            Some(tx) => {
                // The receiver may have been dropped, if its caller went away.
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(id = %response.id, "ignoring response with unknown id");
            }
        }
    }

    /// Fulfill every pending resolver with a synthetic failure Response
    /// and refuse future registrations. Returns the number of resolvers flushed.
    pub fn flush(&self) -> usize {
        let resolvers = {
            let mut pending = self.pending.lock().unwrap();
            pending.flushed = true;
            std::mem::take(&mut pending.resolvers)
        };
        let count = resolvers.len();

        for (id, tx) in resolvers {
            let _ = tx.send(Response::job_ended(id));
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().resolvers.len()
    }
}
