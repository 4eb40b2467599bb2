//! Client identity and authorization.
//!
//! The access-control policy engine is an external collaborator; this module
//! only defines the predicate the server consults and the interceptor that
//! establishes *who* is asking. The subject is the common name of the first
//! client certificate presented over mutual TLS.

use tonic::{Request, Status};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

/// The object every produce/consume is checked against.
pub const OBJECT_WILDCARD: &str = "*";

/// Action name for appends.
pub const ACTION_PRODUCE: &str = "produce";

/// Action name for reads.
pub const ACTION_CONSUME: &str = "consume";

/// The external access-control predicate.
pub trait Authorizer: Send + Sync + 'static {
    /// Returns true if `subject` may perform `action` on `object`.
    fn authorize(&self, subject: &str, object: &str, action: &str) -> bool;
}

/// The authenticated client identity, stored in request extensions by
/// [`subject_interceptor`].
#[derive(Debug, Clone)]
pub struct Subject(
    /// The client certificate's common name.
    pub String,
);

/// Interceptor that extracts the client-certificate common name into the
/// request extensions, for both unary and streaming calls.
///
/// Requests without a client certificate pass through with no subject;
/// handlers that require one reject them with `PermissionDenied`.
///
/// # Errors
/// Returns `Unauthenticated` when a certificate is presented but its
/// common name cannot be parsed.
pub fn subject_interceptor(mut request: Request<()>) -> Result<Request<()>, Status> {
    let Some(certs) = request.peer_certs() else {
        return Ok(request);
    };
    let Some(cert) = certs.first() else {
        return Ok(request);
    };

    let subject = common_name(cert.as_ref())
        .ok_or_else(|| Status::unauthenticated("client certificate has no common name"))?;
    debug!(subject = %subject, "authenticated client");
    request.extensions_mut().insert(Subject(subject));
    Ok(request)
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToOwned::to_owned);
    name
}

/// Returns the request's subject, or `PermissionDenied` when the client
/// presented no identity.
pub(crate) fn subject_of<T>(request: &Request<T>) -> Result<&str, Status> {
    request
        .extensions()
        .get::<Subject>()
        .map(|s| s.0.as_str())
        .ok_or_else(|| Status::permission_denied("no identity presented"))
}
