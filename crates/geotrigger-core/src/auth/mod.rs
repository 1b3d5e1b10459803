pub mod payload;
pub mod resolver;

pub use payload::{
    build_function_payload, build_payment_payload, FunctionPayload, PayloadError, PaymentPayload,
    SignedPayload, PAYLOAD_FRESHNESS_SECONDS,
};
pub use resolver::{resolve_mode, AuthMode, AuthResolver, REGISTRATION_SETTLE};
