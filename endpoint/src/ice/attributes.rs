use stun::attributes::{ATTR_ICE_CONTROLLING, ATTR_PRIORITY, ATTR_USE_CANDIDATE};
use stun::message::{Message, Setter};

/// ICE-CONTROLLING attribute: the sender's controlling-role tie-breaker.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct AttrControlling(pub u64);

impl Setter for AttrControlling {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_ICE_CONTROLLING, &self.0.to_be_bytes());
        Ok(())
    }
}

/// PRIORITY attribute: the candidate priority the sender advertises for
/// the transport this check probes.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct PriorityAttr(pub u32);

impl Setter for PriorityAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_PRIORITY, &self.0.to_be_bytes());
        Ok(())
    }
}

/// USE-CANDIDATE attribute: present on every check under aggressive
/// nomination, so the first successful pair is the nominated one.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub struct UseCandidateAttr;

impl UseCandidateAttr {
    pub fn new() -> Self {
        UseCandidateAttr
    }

    pub fn is_set(m: &Message) -> bool {
        m.contains(ATTR_USE_CANDIDATE)
    }
}

impl Setter for UseCandidateAttr {
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_USE_CANDIDATE, &[]);
        Ok(())
    }
}
