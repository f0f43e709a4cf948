//! IKEv1 state kinds
//!
//! Every state name describes what has happened in the past, not what
//! the next message is. `MAIN_R1` is a responder that has sent its R1
//! reply and is waiting for I2.
//!
//! ```text
//! Main Mode                     Aggressive Mode
//!
//! I: --> HDR, SA       MAIN_I1  I: --> HDR, SA, KE, Ni, IDii  AGGR_I1
//! R: <-- HDR, SA       MAIN_R1  R: <-- HDR, SA, KE, Nr, IDir,
//! I: --> HDR, KE, Ni   MAIN_I2         HASH_R                 AGGR_R1
//! R: <-- HDR, KE, Nr   MAIN_R2  I: --> HDR*, HASH_I           AGGR_I2
//! I: --> HDR*, IDi,                                           AGGR_R2
//!        HASH_I        MAIN_I3
//! R: <-- HDR*, IDr,
//!        HASH_R        MAIN_R3
//! I: (done)            MAIN_I4
//! ```

/// IKEv1 state kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Main Mode responder, nothing received yet
    MainR0,
    /// Main Mode initiator, sent SA offer
    MainI1,
    /// Main Mode responder, replied with SA choice
    MainR1,
    /// Main Mode initiator, sent KE and nonce
    MainI2,
    /// Main Mode responder, replied with KE and nonce
    MainR2,
    /// Main Mode initiator, sent encrypted ID and auth
    MainI3,
    /// Main Mode responder, replied with ID and auth; ISAKMP SA established
    MainR3,
    /// Main Mode initiator done; ISAKMP SA established
    MainI4,

    /// Aggressive Mode responder, nothing received yet
    AggrR0,
    /// Aggressive Mode initiator, sent first packet
    AggrI1,
    /// Aggressive Mode responder, replied
    AggrR1,
    /// Aggressive Mode initiator done; ISAKMP SA established
    AggrI2,
    /// Aggressive Mode responder done; ISAKMP SA established
    AggrR2,

    /// Quick Mode responder, nothing received yet
    QuickR0,
    /// Quick Mode initiator, sent first packet
    QuickI1,
    /// Quick Mode responder, replied; inbound IPsec SA installed
    QuickR1,
    /// Quick Mode initiator done; IPsec SAs installed
    QuickI2,
    /// Quick Mode responder done; IPsec SAs installed
    QuickR2,

    /// Plaintext informational exchange
    Info,
    /// Encrypted informational exchange
    InfoProtected,

    /// XAUTH server, challenge sent
    XauthR0,
    /// XAUTH server, reply received, result sent
    XauthR1,
    /// XAUTH client, waiting for challenge
    XauthI0,
    /// XAUTH client, replied to challenge
    XauthI1,

    /// Mode Config server, waiting for request (pull)
    ModeCfgR0,
    /// Mode Config server, sent set (push) or replied (pull)
    ModeCfgR1,
    /// Mode Config server, acknowledged; configuration done
    ModeCfgR2,
    /// Mode Config client, sent request
    ModeCfgI1,
}

impl State {
    /// Short state name, as logged
    pub fn name(self) -> &'static str {
        match self {
            State::MainR0 => "MAIN_R0",
            State::MainI1 => "MAIN_I1",
            State::MainR1 => "MAIN_R1",
            State::MainI2 => "MAIN_I2",
            State::MainR2 => "MAIN_R2",
            State::MainI3 => "MAIN_I3",
            State::MainR3 => "MAIN_R3",
            State::MainI4 => "MAIN_I4",
            State::AggrR0 => "AGGR_R0",
            State::AggrI1 => "AGGR_I1",
            State::AggrR1 => "AGGR_R1",
            State::AggrI2 => "AGGR_I2",
            State::AggrR2 => "AGGR_R2",
            State::QuickR0 => "QUICK_R0",
            State::QuickI1 => "QUICK_I1",
            State::QuickR1 => "QUICK_R1",
            State::QuickI2 => "QUICK_I2",
            State::QuickR2 => "QUICK_R2",
            State::Info => "INFO",
            State::InfoProtected => "INFO_PROTECTED",
            State::XauthR0 => "XAUTH_R0",
            State::XauthR1 => "XAUTH_R1",
            State::XauthI0 => "XAUTH_I0",
            State::XauthI1 => "XAUTH_I1",
            State::ModeCfgR0 => "MODE_CFG_R0",
            State::ModeCfgR1 => "MODE_CFG_R1",
            State::ModeCfgR2 => "MODE_CFG_R2",
            State::ModeCfgI1 => "MODE_CFG_I1",
        }
    }

    /// Phase 1 state (Main or Aggressive Mode)
    pub fn is_phase1(self) -> bool {
        matches!(
            self,
            State::MainR0
                | State::MainI1
                | State::MainR1
                | State::MainI2
                | State::MainR2
                | State::MainI3
                | State::MainR3
                | State::MainI4
                | State::AggrR0
                | State::AggrI1
                | State::AggrR1
                | State::AggrI2
                | State::AggrR2
        )
    }

    /// Phase 1.5 state (XAUTH or Mode Config)
    pub fn is_phase15(self) -> bool {
        matches!(
            self,
            State::XauthR0
                | State::XauthR1
                | State::XauthI0
                | State::XauthI1
                | State::ModeCfgR0
                | State::ModeCfgR1
                | State::ModeCfgR2
                | State::ModeCfgI1
        )
    }

    /// Quick Mode state
    pub fn is_quick(self) -> bool {
        matches!(
            self,
            State::QuickR0 | State::QuickI1 | State::QuickR1 | State::QuickI2 | State::QuickR2
        )
    }

    /// States whose SA has keying material, so encrypted traffic can be
    /// handled
    pub fn has_keymat(self) -> bool {
        !matches!(
            self,
            State::MainR0
                | State::MainI1
                | State::MainR1
                | State::MainI2
                | State::AggrR0
                | State::AggrI1
                | State::Info
        )
    }

    /// States whose peer has been authenticated
    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            State::MainR3 | State::MainI4 | State::AggrR1 | State::AggrI2 | State::AggrR2
        ) || self.is_quick()
            || self.is_phase15()
    }

    /// Fully established ISAKMP SA (Phase 1 complete, Phase 1.5 not in
    /// the way)
    pub fn is_established(self) -> bool {
        matches!(
            self,
            State::MainR3 | State::MainI4 | State::AggrI2 | State::AggrR2
        )
    }

    /// Mode Config completed on the server side
    pub fn is_mode_cfg_established(self) -> bool {
        matches!(self, State::ModeCfgR2)
    }

    /// Stable ordinal, used for admin progress codes (100 + index)
    pub fn index(self) -> u16 {
        match self {
            State::MainR0 => 0,
            State::MainI1 => 1,
            State::MainR1 => 2,
            State::MainI2 => 3,
            State::MainR2 => 4,
            State::MainI3 => 5,
            State::MainR3 => 6,
            State::MainI4 => 7,
            State::AggrR0 => 8,
            State::AggrI1 => 9,
            State::AggrR1 => 10,
            State::AggrI2 => 11,
            State::AggrR2 => 12,
            State::QuickR0 => 13,
            State::QuickI1 => 14,
            State::QuickR1 => 15,
            State::QuickI2 => 16,
            State::QuickR2 => 17,
            State::Info => 18,
            State::InfoProtected => 19,
            State::XauthR0 => 20,
            State::XauthR1 => 21,
            State::XauthI0 => 22,
            State::XauthI1 => 23,
            State::ModeCfgR0 => 24,
            State::ModeCfgR1 => 25,
            State::ModeCfgR2 => 26,
            State::ModeCfgI1 => 27,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_predicates() {
        assert!(State::MainR0.is_phase1());
        assert!(State::AggrR2.is_phase1());
        assert!(!State::QuickR0.is_phase1());
        assert!(!State::XauthR0.is_phase1());

        assert!(State::XauthI1.is_phase15());
        assert!(State::ModeCfgR2.is_phase15());
        assert!(!State::MainR3.is_phase15());

        assert!(State::QuickI2.is_quick());
        assert!(!State::Info.is_quick());
    }

    #[test]
    fn test_keymat_predicate() {
        // No SKEYID before the second Main Mode round trip
        assert!(!State::MainR0.has_keymat());
        assert!(!State::MainI2.has_keymat());
        assert!(!State::AggrI1.has_keymat());
        assert!(!State::Info.has_keymat());

        assert!(State::MainR2.has_keymat());
        assert!(State::AggrR1.has_keymat());
        assert!(State::QuickR0.has_keymat());
        assert!(State::InfoProtected.has_keymat());
    }

    #[test]
    fn test_established_predicate() {
        assert!(State::MainR3.is_established());
        assert!(State::MainI4.is_established());
        assert!(State::AggrI2.is_established());
        assert!(State::AggrR2.is_established());

        assert!(!State::MainR2.is_established());
        assert!(!State::ModeCfgR2.is_established());
        assert!(!State::QuickR2.is_established());
    }

    #[test]
    fn test_authenticated_predicate() {
        assert!(State::MainR3.is_authenticated());
        assert!(State::QuickR0.is_authenticated());
        assert!(State::XauthI0.is_authenticated());
        assert!(!State::MainR2.is_authenticated());
        assert!(!State::AggrR0.is_authenticated());
    }

    #[test]
    fn test_names() {
        assert_eq!(State::MainR0.name(), "MAIN_R0");
        assert_eq!(State::ModeCfgI1.to_string(), "MODE_CFG_I1");
    }
}
