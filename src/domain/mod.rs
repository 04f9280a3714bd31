//! Domain Layer
//!
//! Pure business types and logic for backend selection and sticky sessions.
//! Nothing here touches sockets; I/O lives behind the traits in `ports`.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;
