//! Positional handler arguments

use crate::registry::{ParamKind, ParamSpec, Payload};
use crate::topic::PathParams;
use crate::transport::RawPacket;

/// One positional argument
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerArg {
    Payload(Payload),
    Topic(String),
    RawPacket(RawPacket),
    PathParams(PathParams),
    /// Position not covered by any parameter binding
    Missing,
}

/// Arguments built from an entry's parameter bindings
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandlerArgs {
    args: Vec<HandlerArg>,
}

impl HandlerArgs {
    pub fn build(
        specs: &[ParamSpec],
        payload: &Payload,
        packet: &RawPacket,
        params: &PathParams,
    ) -> Self {
        let len = specs.iter().map(|s| s.index + 1).max().unwrap_or(0);
        let mut args = vec![HandlerArg::Missing; len];

        for spec in specs {
            args[spec.index] = match spec.kind {
                ParamKind::Payload => HandlerArg::Payload(payload.clone()),
                ParamKind::Topic => HandlerArg::Topic(packet.topic.clone()),
                ParamKind::RawPacket => HandlerArg::RawPacket(packet.clone()),
                ParamKind::PathParams => HandlerArg::PathParams(params.clone()),
            };
        }

        Self { args }
    }

    pub fn get(&self, index: usize) -> Option<&HandlerArg> {
        self.args.get(index)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerArg> {
        self.args.iter()
    }

    /// First payload argument
    pub fn payload(&self) -> Option<&Payload> {
        self.args.iter().find_map(|a| match a {
            HandlerArg::Payload(p) => Some(p),
            _ => None,
        })
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        self.payload().and_then(Payload::as_json)
    }

    pub fn topic(&self) -> Option<&str> {
        self.args.iter().find_map(|a| match a {
            HandlerArg::Topic(t) => Some(t.as_str()),
            _ => None,
        })
    }

    pub fn raw_packet(&self) -> Option<&RawPacket> {
        self.args.iter().find_map(|a| match a {
            HandlerArg::RawPacket(p) => Some(p),
            _ => None,
        })
    }

    pub fn path_params(&self) -> Option<&PathParams> {
        self.args.iter().find_map(|a| match a {
            HandlerArg::PathParams(p) => Some(p),
            _ => None,
        })
    }
}
