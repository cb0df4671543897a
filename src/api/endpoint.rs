//! Endpoints: the component's communication terminals.
//!
//! An endpoint is declared through [`EndpointBuilder`] and registered
//! with the core. Giving it a handler makes it push-mode — inbound
//! messages invoke the handler on the dispatcher task as they arrive.
//! Without a handler the endpoint is pull-mode (queuing): the core
//! buffers inbound traffic and the component drains it with the
//! blocking `fetch_*` calls.

use std::sync::Arc;

use serde_json::Value;

use crate::codec::ReturnKind;
use crate::core::EndpointKind;
use crate::error::{Error, Result};
use crate::message::{Message, Status, generate_endpoint_id, next_message_id};

use super::Middleware;

/// Handler invoked for each inbound message of a push-mode endpoint.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Shared endpoint state, reachable from the dispatcher task.
pub(crate) struct EndpointShared {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: EndpointKind,
    pub queuing: bool,
    pub handler: Option<MessageHandler>,
}

/// Declares an endpoint field by field, then registers it.
pub struct EndpointBuilder {
    mw: Middleware,
    kind: EndpointKind,
    name: String,
    description: String,
    message_schema: Option<Value>,
    response_schema: Option<Value>,
    handler: Option<MessageHandler>,
}

impl EndpointBuilder {
    pub(crate) fn new(mw: Middleware, kind: EndpointKind, name: &str) -> Self {
        Self {
            mw,
            kind,
            name: name.to_string(),
            description: String::new(),
            message_schema: None,
            response_schema: None,
            handler: None,
        }
    }

    /// Human-readable description carried in the manifest.
    #[must_use]
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Schema blob attached to outbound messages (forwarded as-is).
    #[must_use]
    pub fn message_schema(mut self, schema: Value) -> Self {
        self.message_schema = Some(schema);
        self
    }

    /// Schema blob describing responses.
    #[must_use]
    pub fn response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Installs a handler, making the endpoint push-mode.
    #[must_use]
    pub fn handler(mut self, handler: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Registers the endpoint with the core.
    ///
    /// Endpoints without a handler queue in the core and are drained by
    /// the blocking fetch calls; endpoints with a handler are delivered
    /// to as messages arrive.
    ///
    /// # Errors
    ///
    /// Returns an error when the core rejects the declaration or the
    /// channel is gone.
    pub async fn register(self) -> Result<Endpoint> {
        let id = generate_endpoint_id();
        let queuing = self.handler.is_none();
        let mut decl = serde_json::json!({
            "ep_id": id.clone(),
            "ep_name": self.name.clone(),
            "ep_description": self.description.clone(),
            "ep_type": self.kind.as_str(),
            "blocking": i32::from(queuing),
        });
        if let Some(obj) = decl.as_object_mut() {
            if let Some(schema) = &self.message_schema {
                obj.insert("message".to_string(), schema.clone());
            }
            if let Some(schema) = &self.response_schema {
                obj.insert("response".to_string(), schema.clone());
            }
        }
        let status = self
            .mw
            .call_int("register_endpoint", vec![decl.to_string()])
            .await?;
        if status != 0 {
            return Err(Error::InvalidArgument(format!(
                "endpoint registration failed with status {status}"
            )));
        }
        let shared = Arc::new(EndpointShared {
            id: id.clone(),
            name: self.name,
            description: self.description,
            kind: self.kind,
            queuing,
            handler: self.handler,
        });
        self.mw.inner.endpoints.insert(id, Arc::clone(&shared));
        Ok(Endpoint {
            mw: self.mw,
            shared,
        })
    }
}

/// A registered endpoint.
#[derive(Clone)]
pub struct Endpoint {
    mw: Middleware,
    shared: Arc<EndpointShared>,
}

impl Endpoint {
    /// The process-unique ten-character endpoint id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.shared.description
    }

    #[must_use]
    pub fn kind(&self) -> EndpointKind {
        self.shared.kind
    }

    /// True for pull-mode endpoints (no handler; core-side queues).
    #[must_use]
    pub fn queuing(&self) -> bool {
        self.shared.queuing
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Publishes a message to every mapped peer.
    ///
    /// # Errors
    ///
    /// Returns an error only when the core channel is gone; delivery
    /// itself is fire-and-forget.
    pub async fn send_message(&self, body: &Value) -> Result<()> {
        self.mw
            .call(
                "ep_send_message",
                ReturnKind::Void,
                vec![
                    self.shared.id.clone(),
                    next_message_id(),
                    body.to_string(),
                ],
            )
            .await
    }

    /// Publishes a raw string body.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn send_message_str(&self, body: &str) -> Result<()> {
        self.mw
            .call(
                "ep_send_message",
                ReturnKind::Void,
                vec![
                    self.shared.id.clone(),
                    next_message_id(),
                    body.to_string(),
                ],
            )
            .await
    }

    /// Issues a request; returns the request id correlating its
    /// responses.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn send_request(&self, body: &Value) -> Result<String> {
        let msg = Message::new(Status::Req, body.clone());
        let req_id = msg.msg_id.clone();
        self.mw
            .call(
                "ep_send_request",
                ReturnKind::Void,
                vec![self.shared.id.clone(), req_id.clone(), msg.to_string()],
            )
            .await?;
        Ok(req_id)
    }

    /// Issues a request and waits for its first response.
    ///
    /// Only pull-mode endpoints can block for a response; push-mode
    /// endpoints receive responses through their handler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on a non-queuing endpoint, or
    /// a channel error.
    pub async fn send_request_blocking(&self, body: &Value) -> Result<Option<Message>> {
        if !self.shared.queuing {
            return Err(Error::InvalidArgument(
                "cannot block for a response on a non-queuing endpoint".to_string(),
            ));
        }
        let req_id = self.send_request(body).await?;
        self.fetch_response(&req_id).await
    }

    /// Sends one response in a stream answering `req_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn send_response(&self, req_id: &str, body: &Value) -> Result<()> {
        let msg = Message::with_id(Status::RespNext, req_id, body.clone());
        self.mw
            .call(
                "ep_send_response",
                ReturnKind::Void,
                vec![self.shared.id.clone(), req_id.to_string(), msg.to_string()],
            )
            .await
    }

    /// Sends the terminal response for `req_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn send_last_response(&self, req_id: &str, body: &Value) -> Result<()> {
        let msg = Message::with_id(Status::RespLast, req_id, body.clone());
        self.mw
            .call(
                "ep_send_response",
                ReturnKind::Void,
                vec![self.shared.id.clone(), req_id.to_string(), msg.to_string()],
            )
            .await
    }

    // ------------------------------------------------------------------
    // Pull-mode fetches
    // ------------------------------------------------------------------

    /// Fetches the next queued message; `None` after the 5 s timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn fetch_message(&self) -> Result<Option<Message>> {
        self.mw
            .call_msg("ep_fetch_message", vec![self.shared.id.clone()])
            .await
    }

    /// Fetches the next queued request.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn fetch_request(&self) -> Result<Option<Message>> {
        self.mw
            .call_msg("ep_fetch_request", vec![self.shared.id.clone()])
            .await
    }

    /// Fetches the next queued response for a request id.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn fetch_response(&self, req_id: &str) -> Result<Option<Message>> {
        self.mw
            .call_msg(
                "ep_fetch_response",
                vec![self.shared.id.clone(), req_id.to_string()],
            )
            .await
    }

    /// Number of queued messages.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn more_messages(&self) -> Result<i64> {
        self.mw
            .call_int("ep_more_messages", vec![self.shared.id.clone()])
            .await
    }

    /// Number of queued requests.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn more_requests(&self) -> Result<i64> {
        self.mw
            .call_int("ep_more_requests", vec![self.shared.id.clone()])
            .await
    }

    /// Number of queued responses for a request id.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn more_responses(&self, req_id: &str) -> Result<i64> {
        self.mw
            .call_int(
                "ep_more_responses",
                vec![self.shared.id.clone(), req_id.to_string()],
            )
            .await
    }

    // ------------------------------------------------------------------
    // Filters and access
    // ------------------------------------------------------------------

    /// Appends one filter predicate (e.g. `value > 10`).
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn add_filter(&self, filter: &str) -> Result<()> {
        self.mw
            .call(
                "ep_add_filter",
                ReturnKind::Void,
                vec![self.shared.id.clone(), filter.to_string()],
            )
            .await
    }

    /// Replaces the filter list; an empty slice clears it.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn set_filters(&self, filters: &[&str]) -> Result<()> {
        let query = serde_json::to_string(filters)?;
        self.mw
            .call(
                "ep_reset_filter",
                ReturnKind::Void,
                vec![self.shared.id.clone(), query],
            )
            .await
    }

    /// Admits a subject to the endpoint's access set.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn set_access(&self, subject: &str) -> Result<()> {
        self.mw
            .call(
                "ep_set_access",
                ReturnKind::Void,
                vec![self.shared.id.clone(), subject.to_string()],
            )
            .await
    }

    /// Removes a subject (empty string clears the whole set).
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn reset_access(&self, subject: &str) -> Result<()> {
        self.mw
            .call(
                "ep_reset_access",
                ReturnKind::Void,
                vec![self.shared.id.clone(), subject.to_string()],
            )
            .await
    }

    // ------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------

    /// Maps this endpoint to a peer at `address`, trying every transport
    /// module. Returns a non-negative mapping handle, -1 on transport
    /// failure, -2 on invalid arguments.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn map(&self, address: &str, ep_query: &str, cpt_query: &str) -> Result<i64> {
        if address.is_empty() {
            return Ok(-2);
        }
        self.mw
            .call_int(
                "map",
                vec![
                    self.shared.id.clone(),
                    address.to_string(),
                    normalize(ep_query),
                    normalize(cpt_query),
                ],
            )
            .await
    }

    /// Maps over one named transport module only.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn map_module(
        &self,
        module: &str,
        address: &str,
        ep_query: &str,
        cpt_query: &str,
    ) -> Result<i64> {
        if module.is_empty() || address.is_empty() {
            return Ok(-2);
        }
        self.mw
            .call_int(
                "map_module",
                vec![
                    self.shared.id.clone(),
                    module.to_string(),
                    address.to_string(),
                    normalize(ep_query),
                    normalize(cpt_query),
                ],
            )
            .await
    }

    /// Asks the registered RDCs for matching endpoints and maps to at
    /// most `max_maps` of them.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn map_lookup(&self, ep_query: &str, cpt_query: &str, max_maps: usize) -> Result<()> {
        self.mw
            .call(
                "map_lookup",
                ReturnKind::Void,
                vec![
                    self.shared.id.clone(),
                    normalize(ep_query),
                    normalize(cpt_query),
                    max_maps.to_string(),
                ],
            )
            .await
    }

    /// Unmaps from an address; returns how many mappings were torn down
    /// (0 when none matched).
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn unmap(&self, address: &str) -> Result<i64> {
        self.mw
            .call_int(
                "unmap",
                vec![self.shared.id.clone(), address.to_string()],
            )
            .await
    }

    /// Unmaps exactly the mapping carried on one connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn unmap_connection(&self, module: &str, conn: u64) -> Result<i64> {
        self.mw
            .call_int(
                "unmap_connection",
                vec![
                    self.shared.id.clone(),
                    module.to_string(),
                    conn.to_string(),
                ],
            )
            .await
    }

    /// Unmaps every mapping of this endpoint; returns the count.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn unmap_all(&self) -> Result<i64> {
        self.mw
            .call_int("unmap_all", vec![self.shared.id.clone()])
            .await
    }

    /// Retargets an existing mapping at a different remote endpoint id
    /// without re-handshaking.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn divert(&self, from_ep: &str, address: &str, to_ep: &str) -> Result<i64> {
        self.mw
            .call_int(
                "divert",
                vec![
                    self.shared.id.clone(),
                    from_ep.to_string(),
                    address.to_string(),
                    to_ep.to_string(),
                ],
            )
            .await
    }

    /// Lists this endpoint's mappings as `{"all_mappings": [...]}`.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn connections(&self) -> Result<Value> {
        let text = self
            .mw
            .call_str("ep_get_all_conns", vec![self.shared.id.clone()])
            .await?;
        Ok(text
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_else(|| serde_json::json!({ "all_mappings": [] })))
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Asks mapped peers to open their byte-pipes.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn start_stream(&self) -> Result<()> {
        self.mw
            .call(
                "ep_stream_start",
                ReturnKind::Void,
                vec![self.shared.id.clone()],
            )
            .await
    }

    /// Asks mapped peers to close their byte-pipes.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn stop_stream(&self) -> Result<()> {
        self.mw
            .call(
                "ep_stream_stop",
                ReturnKind::Void,
                vec![self.shared.id.clone()],
            )
            .await
    }

    /// Sends raw stream data to mapped peers.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn send_stream(&self, data: &str) -> Result<()> {
        self.mw
            .call(
                "ep_stream_send",
                ReturnKind::Void,
                vec![self.shared.id.clone(), data.to_string()],
            )
            .await
    }

    /// Unregisters the endpoint: unmaps everything and frees the
    /// core-side record.
    ///
    /// # Errors
    ///
    /// Returns an error when the core channel is gone.
    pub async fn unregister(self) -> Result<()> {
        self.mw
            .call(
                "remove_endpoint",
                ReturnKind::Void,
                vec![self.shared.id.clone()],
            )
            .await?;
        self.mw.inner.endpoints.remove(&self.shared.id);
        Ok(())
    }
}

/// Empty and one-character queries mean "match all".
fn normalize(query: &str) -> String {
    if query.trim().len() <= 1 {
        "[]".to_string()
    } else {
        query.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_normalisation() {
        assert_eq!(normalize(""), "[]");
        assert_eq!(normalize(" "), "[]");
        assert_eq!(normalize("x"), "[]");
        assert_eq!(normalize(r#"["a = 'b'"]"#), r#"["a = 'b'"]"#);
    }
}
