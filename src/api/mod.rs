mod impls;
mod requests;
mod responses;
mod sibyl;
mod util;

pub use self::sibyl::*;
pub use impls::*;
pub use requests::*;
pub use responses::*;
pub use util::*;
