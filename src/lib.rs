//! Windows MDM enrollment and management server.
//!
//! Implements the device side protocols a Windows client speaks when it joins
//! and is managed by a mobile device management server:
//!
//! - Discovery and certificate enrollment policy (MS-MDE2, MS-XCEP)
//! - Certificate enrollment and renewal (MS-WSTEP) backed by an OpenSSL issuing identity
//! - WAP provisioning documents configuring the management client
//! - OMA-DM management sessions over SyncML
//! - Federated JWT verification against a periodically refreshed key set
//!
//! Decisions about what to send a device, which devices to record and which
//! credentials to accept are delegated to the collaborator traits in [`service`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use zentinel_mdm::{router, AppState, CertificateAuthority, Collaborators, MdmConfig};
//!
//! let config = MdmConfig::default();
//! let authority = Arc::new(CertificateAuthority::load(&config.identity)?);
//! let state = Arc::new(AppState::new(&config, authority, Collaborators::defaults(&config, None)));
//! let listener = tokio::net::TcpListener::bind(&config.settings.listen_address).await?;
//! axum::serve(listener, router(state)).await?;
//! ```

pub mod config;
pub mod discovery;
pub mod enrollment;
pub mod error;
pub mod fault;
pub mod federation;
pub mod identity;
pub mod manage;
pub mod policy;
pub mod server;
pub mod service;
pub mod soap;
pub mod syncml;
pub mod validator;
pub mod wap;
pub mod xml;

pub use config::MdmConfig;
pub use error::{FaultCode, MdmError, ViolationCode};
pub use federation::{FederatedKeyCache, FederatedTokenVerifier};
pub use identity::CertificateAuthority;
pub use server::{router, AppState, Collaborators, PeerCertificate};
