use std::{collections::HashMap, sync::Arc};

use crate::{
    authn::{
        AnonymousAuthenticator, Authenticator, MessageSigningAuthenticator, NoopAuthenticator,
        UnauthorizedAuthenticator,
    },
    authz::{
        AllowAuthorizer, Authorizer, AuthzError, DenyAuthorizer, RemoteJsonAuthorizer,
        RequiredScopeAuthorizer,
    },
    credentials::{CredentialsSigner, CredentialsVerifier, JwksSigner, JwksVerifier},
};

/// Pipeline handlers by id.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    authenticators: HashMap<&'static str, Arc<dyn Authenticator>>,
    authorizers: HashMap<&'static str, Arc<dyn Authorizer>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler, backed by JWKS credentials.
    pub fn with_defaults(http_client: reqwest::Client) -> Result<Self, AuthzError> {
        let verifier = Arc::new(JwksVerifier::new(http_client.clone()));
        let signer = Arc::new(JwksSigner::new(http_client));
        Self::with_credentials(verifier, signer)
    }

    /// Registry with every built-in handler, using the given credential backends.
    pub fn with_credentials(
        verifier: Arc<dyn CredentialsVerifier>,
        signer: Arc<dyn CredentialsSigner>,
    ) -> Result<Self, AuthzError> {
        let mut registry = Self::new();
        registry.register_authenticator(Arc::new(MessageSigningAuthenticator::new(verifier)));
        registry.register_authenticator(Arc::new(AnonymousAuthenticator));
        registry.register_authenticator(Arc::new(NoopAuthenticator));
        registry.register_authenticator(Arc::new(UnauthorizedAuthenticator));

        registry.register_authorizer(Arc::new(RemoteJsonAuthorizer::new(signer)?));
        registry.register_authorizer(Arc::new(RequiredScopeAuthorizer));
        registry.register_authorizer(Arc::new(AllowAuthorizer));
        registry.register_authorizer(Arc::new(DenyAuthorizer));
        Ok(registry)
    }

    /// Registers `authenticator`, replacing any handler with the same id.
    pub fn register_authenticator(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.authenticators.insert(authenticator.id(), authenticator);
    }

    /// Registers `authorizer`, replacing any handler with the same id.
    pub fn register_authorizer(&mut self, authorizer: Arc<dyn Authorizer>) {
        self.authorizers.insert(authorizer.id(), authorizer);
    }

    pub fn authenticator(&self, id: &str) -> Option<Arc<dyn Authenticator>> {
        self.authenticators.get(id).cloned()
    }

    pub fn authorizer(&self, id: &str) -> Option<Arc<dyn Authorizer>> {
        self.authorizers.get(id).cloned()
    }

    /// Registered authenticator ids, sorted.
    pub fn authenticator_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.authenticators.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Registered authorizer ids, sorted.
    pub fn authorizer_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.authorizers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
