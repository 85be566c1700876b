mod agent;
mod channel;
