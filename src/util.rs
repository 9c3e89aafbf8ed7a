pub mod io;
pub mod sha1;
