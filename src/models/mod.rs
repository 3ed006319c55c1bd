pub mod payload;
pub mod request;

pub use payload::{AuthorizationPayload, TokenDomain};
pub use request::{
    AuthorizationSignature, NewRequest, PaymentAuthorizationRequest, RequestStatus, Transition,
};
