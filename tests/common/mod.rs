pub(crate) mod gateway;

pub(crate) mod logging;

pub(crate) mod network;

pub(crate) mod node;
