//! Shared fixtures for unit tests: a world with one funded owner wallet and
//! a keyring that can sign for it.

use crate::modules::action::{ActionKind, SignedAction};
use crate::modules::lifecycle;
use crate::modules::validator::{self, Verdict};
use crate::modules::wallet::{Keyring, WalletStore};
use crate::modules::world::{AgentId, AgentSpec, Position, WorldState};

pub(crate) struct Sandbox {
    pub world: WorldState,
    pub keyring: Keyring,
    pub owner: String,
}

impl Sandbox {
    pub fn new() -> Self {
        let mut wallets = WalletStore::default();
        let wallet = wallets.create().clone();
        let keyring = wallets.keyring().unwrap();
        let mut world = WorldState::default();
        world.register_wallet_key(&wallet.address, &wallet.public_key);
        Self {
            world,
            keyring,
            owner: wallet.address,
        }
    }

    pub fn spawn(&mut self, qi: u64, position: Position) -> AgentId {
        let (id, _) = lifecycle::spawn(
            &mut self.world,
            AgentSpec {
                owner: self.owner.clone(),
                qi,
                position,
                max_age: None,
            },
        )
        .unwrap();
        id
    }

    pub fn sign(&self, agent_id: AgentId, nonce: u64, token: &str) -> SignedAction {
        self.sign_kind(agent_id, nonce, token.parse().unwrap())
    }

    pub fn sign_kind(&self, agent_id: AgentId, nonce: u64, kind: ActionKind) -> SignedAction {
        let signature = self.keyring.sign(&self.owner, agent_id, nonce, &kind).unwrap();
        SignedAction {
            agent_id,
            nonce,
            kind,
            signature,
        }
    }

    /// Sign `token` with the agent's next nonce and run it through the validator.
    pub fn submit(&mut self, agent_id: AgentId, token: &str) -> Verdict {
        self.submit_kind(agent_id, token.parse().unwrap())
    }

    /// Like [`Sandbox::submit`], skipping the token parser.
    pub fn submit_kind(&mut self, agent_id: AgentId, kind: ActionKind) -> Verdict {
        let nonce = self.world.agent(agent_id).unwrap().last_nonce + 1;
        let action = self.sign_kind(agent_id, nonce, kind);
        validator::validate_and_apply(&mut self.world, &action).unwrap()
    }
}
