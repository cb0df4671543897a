//! Component manifests and resource discovery.
//!
//! The manifest describes this component — name plus every registered
//! endpoint declaration, merged with whatever the component added via
//! `add_manifest`. It rides in HELLO so peers can evaluate component
//! queries, and it is what gets pushed to resource-discovery components
//! (RDCs). `map_lookup` asks every registered RDC for candidates and
//! maps to at most the requested number of them.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::message::{Message, Status};

use super::Core;
use super::state::{Callback, ConnKey, ConnState, Connection, RdcExchange};

impl Core {
    /// Builds the component manifest; `via_module` stamps the transport
    /// the manifest travels over (as HELLO does).
    #[must_use]
    pub(crate) fn build_manifest(&self, via_module: Option<&str>) -> Value {
        let endpoints: Vec<Value> = self.registry.iter().map(|lep| lep.decl.to_json()).collect();
        let mut manifest = json!({
            "app_name": self.app_name,
            "endpoints": endpoints,
        });
        if let Some(obj) = manifest.as_object_mut() {
            // Later add_manifest entries win on key collisions.
            for extra in &self.manifest_extra {
                if let Some(extra) = extra.as_object() {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
            if let Some(module) = via_module {
                obj.insert("com_module".to_string(), json!(module));
            }
        }
        manifest
    }

    /// Announces this component to RDCs: the given (module, address), or
    /// every registered one.
    pub(crate) async fn rdc_register(&mut self, target: Option<(String, String)>) {
        let targets = target.map_or_else(|| self.rdcs.clone(), |t| vec![t]);
        let manifest = self.build_manifest(None);
        for (module, address) in targets {
            let body = json!({ "rdc": "register", "manifest": manifest });
            self.rdc_send(&module, &address, body).await;
        }
    }

    /// Withdraws this component from RDCs: one address, or all.
    pub(crate) async fn rdc_unregister(&mut self, address: Option<String>) {
        let targets: Vec<(String, String)> = match address {
            Some(addr) => self
                .rdcs
                .iter()
                .filter(|(_, a)| *a == addr)
                .cloned()
                .collect(),
            None => self.rdcs.clone(),
        };
        for (module, address) in targets {
            let body = json!({ "rdc": "unregister", "app_name": self.app_name });
            self.rdc_send(&module, &address, body).await;
        }
    }

    /// Fire-and-forget RDC exchange: connect, send, close.
    async fn rdc_send(&mut self, module_name: &str, address: &str, body: Value) {
        let Some(module) = self.module(module_name) else {
            warn!(module = %module_name, "rdc on unknown module");
            return;
        };
        match module.connect(address).await {
            Ok(conn) => {
                let msg = Message::new(Status::Msg, body);
                if let Err(e) = module.send(conn, msg.to_string().as_bytes()).await {
                    warn!(%address, error = %e, "rdc send failed");
                }
                let _ = module.close(conn).await;
            }
            Err(e) => {
                warn!(module = %module_name, %address, error = %e, "rdc connect failed");
            }
        }
    }

    /// Consults every registered RDC for endpoints matching the queries
    /// and maps to at most `max_maps` returned candidates.
    pub(crate) async fn rdc_lookup(&mut self, lep: &str, ep_query: &str, cpt_query: &str, max_maps: usize) {
        if !self.registry.contains(lep) {
            warn!(%lep, "map_lookup for unknown endpoint");
            return;
        }
        for (module_name, address) in self.rdcs.clone() {
            let Some(module) = self.module(&module_name) else {
                continue;
            };
            match module.connect(&address).await {
                Ok(conn) => {
                    let key = (module_name.clone(), conn);
                    let exchange = RdcExchange {
                        lep: lep.to_string(),
                        ep_query: ep_query.to_string(),
                        cpt_query: cpt_query.to_string(),
                        max_maps,
                    };
                    self.conns.insert(Connection::new(
                        key.clone(),
                        ConnState::ExtMsg,
                        Callback::Rdc(exchange),
                    ));
                    let msg = Message::new(
                        Status::Msg,
                        json!({
                            "rdc": "lookup",
                            "ep_query": ep_query,
                            "cpt_query": cpt_query,
                            "max": max_maps,
                        }),
                    );
                    self.send_peer(&key, &msg).await;
                }
                Err(e) => {
                    warn!(module = %module_name, %address, error = %e, "rdc connect failed");
                }
            }
        }
    }

    /// Handles the RDC's lookup answer: a `results` array of
    /// `{address, module}` candidates.
    pub(crate) async fn handle_rdc_frame(&mut self, key: &ConnKey, exchange: &RdcExchange, frame: &[u8]) {
        let parsed = std::str::from_utf8(frame)
            .ok()
            .and_then(|text| Message::parse(text).ok());
        let Some(msg) = parsed else {
            debug!(?key, "unparseable rdc frame");
            return;
        };
        let results = msg
            .body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in results.iter().take(exchange.max_maps) {
            let Some(address) = candidate.get("address").and_then(Value::as_str) else {
                continue;
            };
            let module = candidate
                .get("module")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            let address = address.to_string();
            let code = self
                .start_mapping(
                    &exchange.lep,
                    &address,
                    &exchange.ep_query,
                    &exchange.cpt_query,
                    module.as_deref(),
                    None,
                )
                .await;
            if code < 0 {
                warn!(%address, code, "lookup candidate did not map");
            }
        }
        self.close_conn(key).await;
    }
}
