pub mod dispatcher;
pub mod safety;
