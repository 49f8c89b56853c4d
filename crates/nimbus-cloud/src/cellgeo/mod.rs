//! Cell geolocation provider backends, in fallback order: the regional
//! lookup service first, then the commercial Unwired Labs API.

mod regional;
mod unwired;

pub use regional::RegionalLocationProvider;
pub use unwired::UnwiredProvider;
