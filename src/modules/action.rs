use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::ore::NodeId;
use crate::modules::qi::Qi;
use crate::modules::structure::{StructureId, StructureKind};
use crate::modules::world::AgentId;
use crate::modules::zone::ZoneId;

/// Domain prefix mixed into every signed payload.
const SIGNING_DOMAIN: &[u8] = b"harimu-action-v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum InspectTarget {
    Agent(AgentId),
    Structure(StructureId),
    OreNode(NodeId),
    RechargeNode(NodeId),
    Zone(ZoneId),
}

impl InspectTarget {
    fn token(self) -> String {
        match self {
            InspectTarget::Agent(id) => format!("agent:{}", id),
            InspectTarget::Structure(id) => format!("structure:{}", id),
            InspectTarget::OreNode(id) => format!("ore_node:{}", id),
            InspectTarget::RechargeNode(id) => format!("recharge_node:{}", id),
            InspectTarget::Zone(id) => format!("zone:{}", id),
        }
    }
}

/// Everything an agent may ask the world to do in one tick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Scan,
    Inspect { target: InspectTarget },
    Move { dx: i32, dy: i32, dz: i32 },
    Mine { node_id: NodeId },
    HarvestQiOre,
    Build { kind: StructureKind },
    PlaceBlock { dx: i32, dy: i32, dz: i32 },
    WriteProgram { program: Vec<u8> },
    ClaimZone { radius: i32 },
    JoinZone { zone_id: ZoneId },
    LeaveZone { zone_id: ZoneId },
    ExpandZone { zone_id: ZoneId, by: i32 },
    Reproduce,
    Idle,
}

impl ActionKind {
    pub const fn label(&self) -> &'static str {
        match self {
            ActionKind::Scan => "scan",
            ActionKind::Inspect { .. } => "inspect",
            ActionKind::Move { .. } => "move",
            ActionKind::Mine { .. } => "mine",
            ActionKind::HarvestQiOre => "harvest_qi_ore",
            ActionKind::Build { .. } => "build",
            ActionKind::PlaceBlock { .. } => "place_block",
            ActionKind::WriteProgram { .. } => "write_program",
            ActionKind::ClaimZone { .. } => "claim_zone",
            ActionKind::JoinZone { .. } => "join_zone",
            ActionKind::LeaveZone { .. } => "leave_zone",
            ActionKind::ExpandZone { .. } => "expand_zone",
            ActionKind::Reproduce => "reproduce",
            ActionKind::Idle => "idle",
        }
    }

    /// Read-only actions. They still carry a signature and a nonce.
    pub const fn is_free(&self) -> bool {
        matches!(
            self,
            ActionKind::Scan | ActionKind::Inspect { .. } | ActionKind::Idle
        )
    }

    pub const fn qi_cost(&self) -> Qi {
        if self.is_free() { 0 } else { 1 }
    }

    /// Canonical token form, the same grammar brains reply with.
    pub fn token(&self) -> String {
        match self {
            ActionKind::Inspect { target } => format!("inspect:{}", target.token()),
            ActionKind::Move { dx, dy, dz } => format!("move:{},{},{}", dx, dy, dz),
            ActionKind::Mine { node_id } => format!("mine:{}", node_id),
            ActionKind::Build { kind } => format!("build:{}", kind.label()),
            ActionKind::PlaceBlock { dx, dy, dz } => format!("place_block:{},{},{}", dx, dy, dz),
            ActionKind::WriteProgram { program } => format!("write_program:{}", hex::encode(program)),
            ActionKind::ClaimZone { radius } => format!("claim_zone:{}", radius),
            ActionKind::JoinZone { zone_id } => format!("join_zone:{}", zone_id),
            ActionKind::LeaveZone { zone_id } => format!("leave_zone:{}", zone_id),
            ActionKind::ExpandZone { zone_id, by } => format!("expand_zone:{},{}", zone_id, by),
            ActionKind::Scan | ActionKind::HarvestQiOre | ActionKind::Reproduce | ActionKind::Idle => {
                self.label().to_string()
            }
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseActionError {
    #[error("empty action token")]
    Empty,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("action '{action}' expects {expected}")]
    BadArguments {
        action: &'static str,
        expected: &'static str,
    },
}

/// Largest magnitude accepted for a coordinate, delta or radius in a token.
pub const MAX_TOKEN_MAGNITUDE: i32 = 1 << 20;

fn int(raw: &str) -> Option<i32> {
    let value: i32 = raw.trim().parse().ok()?;
    (value.unsigned_abs() <= MAX_TOKEN_MAGNITUDE.unsigned_abs()).then_some(value)
}

fn ints<const N: usize>(args: &str) -> Option<[i32; N]> {
    let mut out = [0i32; N];
    let mut parts = args.split(',');
    for slot in out.iter_mut() {
        *slot = int(parts.next()?)?;
    }
    parts.next().is_none().then_some(out)
}

fn id(args: &str) -> Option<u64> {
    args.trim().parse().ok()
}

impl FromStr for ActionKind {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if token.is_empty() {
            return Err(ParseActionError::Empty);
        }
        let (name, args) = match token.split_once(':') {
            Some((name, args)) => (name.trim().to_lowercase(), Some(args.trim())),
            None => (token.to_lowercase(), None),
        };
        let bad = |action: &'static str, expected: &'static str| ParseActionError::BadArguments { action, expected };

        let kind = match (name.as_str(), args) {
            ("scan", None) => ActionKind::Scan,
            ("idle", None) => ActionKind::Idle,
            ("harvest_qi_ore", None) => ActionKind::HarvestQiOre,
            ("reproduce", None) => ActionKind::Reproduce,
            ("inspect", Some(args)) => {
                let expected = "agent|structure|ore_node|recharge_node|zone:<id>";
                let (what, raw) = args.split_once(':').ok_or(bad("inspect", expected))?;
                let target_id = id(raw).ok_or(bad("inspect", expected))?;
                let target = match what.trim() {
                    "agent" => InspectTarget::Agent(target_id),
                    "structure" => InspectTarget::Structure(target_id),
                    "ore_node" => InspectTarget::OreNode(target_id),
                    "recharge_node" => InspectTarget::RechargeNode(target_id),
                    "zone" => InspectTarget::Zone(target_id),
                    _ => return Err(bad("inspect", expected)),
                };
                ActionKind::Inspect { target }
            }
            ("move", Some(args)) => {
                let [dx, dy, dz] = ints::<3>(args).ok_or(bad("move", "dx,dy,dz"))?;
                ActionKind::Move { dx, dy, dz }
            }
            ("mine", Some(args)) => ActionKind::Mine {
                node_id: id(args).ok_or(bad("mine", "<node id>"))?,
            },
            ("build", Some(args)) => ActionKind::Build {
                kind: args
                    .parse()
                    .map_err(|_| bad("build", "basic|block|programmable"))?,
            },
            ("place_block", Some(args)) => {
                let [dx, dy, dz] = ints::<3>(args).ok_or(bad("place_block", "dx,dy,dz"))?;
                ActionKind::PlaceBlock { dx, dy, dz }
            }
            ("write_program", Some(args)) => ActionKind::WriteProgram {
                program: hex::decode(args).map_err(|_| bad("write_program", "hex bytecode"))?,
            },
            ("claim_zone", Some(args)) => {
                let [radius] = ints::<1>(args).ok_or(bad("claim_zone", "<radius>"))?;
                ActionKind::ClaimZone { radius }
            }
            ("join_zone", Some(args)) => ActionKind::JoinZone {
                zone_id: id(args).ok_or(bad("join_zone", "<zone id>"))?,
            },
            ("leave_zone", Some(args)) => ActionKind::LeaveZone {
                zone_id: id(args).ok_or(bad("leave_zone", "<zone id>"))?,
            },
            ("expand_zone", Some(args)) => {
                let expected = "<zone id>,<by>";
                let (zone, by) = args.split_once(',').ok_or(bad("expand_zone", expected))?;
                ActionKind::ExpandZone {
                    zone_id: id(zone).ok_or(bad("expand_zone", expected))?,
                    by: int(by).ok_or(bad("expand_zone", expected))?,
                }
            }
            ("scan" | "idle" | "harvest_qi_ore" | "reproduce", Some(_)) => {
                return Err(ParseActionError::UnknownAction(token.to_string()));
            }
            (_, _) => return Err(ParseActionError::UnknownAction(token.to_string())),
        };
        Ok(kind)
    }
}

/// An action bound to an agent, a nonce and the owner's signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAction {
    pub agent_id: AgentId,
    pub nonce: u64,
    pub kind: ActionKind,
    /// Hex encoded ed25519 signature over [`signing_payload`].
    pub signature: String,
}

impl SignedAction {
    pub fn payload(&self) -> Vec<u8> {
        signing_payload(self.agent_id, self.nonce, &self.kind)
    }
}

/// Bytes the owner signs: domain, agent id, nonce, then the canonical token.
pub fn signing_payload(agent_id: AgentId, nonce: u64, kind: &ActionKind) -> Vec<u8> {
    let token = kind.token();
    let mut payload = Vec::with_capacity(SIGNING_DOMAIN.len() + 16 + token.len());
    payload.extend_from_slice(SIGNING_DOMAIN);
    payload.extend_from_slice(&agent_id.to_le_bytes());
    payload.extend_from_slice(&nonce.to_le_bytes());
    payload.extend_from_slice(token.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_documented_token() {
        let cases = [
            ("scan", ActionKind::Scan),
            ("idle", ActionKind::Idle),
            (
                "inspect:agent:3",
                ActionKind::Inspect {
                    target: InspectTarget::Agent(3),
                },
            ),
            ("move:1,0,0", ActionKind::Move { dx: 1, dy: 0, dz: 0 }),
            ("mine:4", ActionKind::Mine { node_id: 4 }),
            ("harvest_qi_ore", ActionKind::HarvestQiOre),
            (
                "build:basic",
                ActionKind::Build {
                    kind: StructureKind::Basic,
                },
            ),
            ("place_block:1,0,0", ActionKind::PlaceBlock { dx: 1, dy: 0, dz: 0 }),
            (
                "write_program:0a0b",
                ActionKind::WriteProgram {
                    program: vec![0x0a, 0x0b],
                },
            ),
            ("claim_zone:2", ActionKind::ClaimZone { radius: 2 }),
            ("join_zone:1", ActionKind::JoinZone { zone_id: 1 }),
            ("leave_zone:1", ActionKind::LeaveZone { zone_id: 1 }),
            ("expand_zone:1,1", ActionKind::ExpandZone { zone_id: 1, by: 1 }),
            ("reproduce", ActionKind::Reproduce),
        ];
        for (token, expected) in cases {
            let parsed: ActionKind = token.parse().unwrap();
            assert_eq!(parsed, expected, "{}", token);
            assert_eq!(parsed.token(), token);
        }
    }

    #[test]
    fn rejects_malformed_tokens() {
        for token in ["", "fly", "move:1,0", "move:a,b,c", "mine", "scan:1", "inspect:planet:1", "write_program:zz"] {
            assert!(token.parse::<ActionKind>().is_err(), "{}", token);
        }
    }

    #[test]
    fn rejects_extreme_numbers() {
        for token in [
            "move:-2147483648,0,0",
            "move:0,2147483647,0",
            "place_block:99999999,0,0",
            "claim_zone:2147483647",
            "expand_zone:1,2147483647",
            "expand_zone:1,-2147483648",
        ] {
            assert!(token.parse::<ActionKind>().is_err(), "{}", token);
        }
        let edge = format!("move:{},0,0", -MAX_TOKEN_MAGNITUDE);
        assert!(edge.parse::<ActionKind>().is_ok());
    }

    #[test]
    fn only_reads_are_free() {
        assert_eq!(ActionKind::Scan.qi_cost(), 0);
        assert_eq!(ActionKind::Idle.qi_cost(), 0);
        assert_eq!(ActionKind::Move { dx: 1, dy: 0, dz: 0 }.qi_cost(), 1);
        assert_eq!(ActionKind::Reproduce.qi_cost(), 1);
    }

    #[test]
    fn payload_binds_nonce() {
        let kind = ActionKind::Scan;
        assert_ne!(signing_payload(1, 1, &kind), signing_payload(1, 2, &kind));
        assert_ne!(signing_payload(1, 1, &kind), signing_payload(2, 1, &kind));
    }
}
