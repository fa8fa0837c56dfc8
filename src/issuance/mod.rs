pub mod acme;
pub mod acme_workflow;
pub mod dns;
pub mod dns_providers;
pub mod flow;
pub mod issuer;
