// Infrastructure - request context, identity and storage boundaries

pub mod identity;
pub mod middleware;
pub mod object_store;
pub mod viewer;
