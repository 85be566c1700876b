#![doc(issue_tracker_base_url = "https://github.com/chainbound/xdpcheck/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

//! Wire format of the control channel spoken between the harness and a capture agent.
//!
//! Every exchange is a [`frame::Message`] carrying an encoded [`control::Request`] or
//! [`control::Response`]. Responses echo the id of the request they answer.

pub mod control;
pub mod frame;
