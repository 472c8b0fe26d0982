// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use qrelay_account::{AccountPool, AccountStore, SingleFlight};
use qrelay_auth::TokenClient;
use qrelay_compress::Compressor;
use qrelay_config::Config;
use qrelay_upstream::{TransportPool, UpstreamClient};
use sha2::{Digest, Sha256};

use crate::loghub::LogHub;
use crate::pipeline::ChatDispatch;
use crate::ready::TokenFlows;

/// Shared service state threaded through every handler.
pub struct Gateway {
    pub config: Arc<Config>,
    pub store: Arc<dyn AccountStore>,
    pub pool: Arc<AccountPool>,
    pub refresher: Arc<SingleFlight>,
    pub tokens: Arc<dyn TokenFlows>,
    pub dispatch: Arc<dyn ChatDispatch>,
    pub compressor: Arc<Compressor>,
    pub log_hub: Arc<LogHub>,
    /// SHA-256 digests of the process-level admin API keys.
    pub admin_keys: Vec<[u8; 32]>,
}

/// Assembles a [`Gateway`], with injection points for the collaborators the
/// tests script (token flows, upstream dispatch).
pub struct GatewayBuilder {
    config: Arc<Config>,
    store: Arc<dyn AccountStore>,
    tokens: Option<Arc<dyn TokenFlows>>,
    dispatch: Option<Arc<dyn ChatDispatch>>,
    data_dir: Option<PathBuf>,
}

impl GatewayBuilder {
    pub fn new(config: Arc<Config>, store: Arc<dyn AccountStore>) -> Self {
        Self {
            config,
            store,
            tokens: None,
            dispatch: None,
            data_dir: None,
        }
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenFlows>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn dispatch(mut self, dispatch: Arc<dyn ChatDispatch>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Directory for the summary-cache persistence.  `None` keeps the
    /// cache in memory only.
    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    pub fn build(self) -> anyhow::Result<Arc<Gateway>> {
        let config = self.config;
        let tokens: Arc<dyn TokenFlows> = match self.tokens {
            Some(t) => t,
            None => Arc::new(TokenClient::new(
                config.upstream.oidc_token_endpoint.clone(),
                config.upstream.social_refresh_endpoint.clone(),
            )),
        };
        let dispatch: Arc<dyn ChatDispatch> = match self.dispatch {
            Some(d) => d,
            None => {
                let proxy = config
                    .upstream
                    .proxy
                    .enabled
                    .then(|| config.upstream.proxy.url_template.clone());
                Arc::new(UpstreamClient::new(
                    TransportPool::new(proxy)?,
                    config.upstream.chat_endpoint.clone(),
                    config.upstream.quota_endpoint.clone(),
                ))
            }
        };

        let pool = Arc::new(AccountPool::new(self.store.clone(), &config.pool));
        let compressor = Arc::new(Compressor::new(
            config.compression.clone(),
            self.data_dir,
        ));
        let admin_keys = config
            .server
            .api_keys
            .iter()
            .map(|k| Sha256::digest(k.as_bytes()).into())
            .collect();

        Ok(Arc::new(Gateway {
            config,
            store: self.store,
            pool,
            refresher: Arc::new(SingleFlight::new()),
            tokens,
            dispatch,
            compressor,
            log_hub: Arc::new(LogHub::new()),
            admin_keys,
        }))
    }
}
