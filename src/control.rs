//! DLCI 0 control-channel command handling (§4.C): CLD, PSC, TEST, MSC,
//! NSC, and the generic ack/NSC-response split.

/// Command/response bit of the type octet.
const CR: u8 = 0x02;
const EA: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxCommandType {
    Pn,
    Cld,
    Psc,
    Test,
    Msc,
    Nsc,
    Rpn,
    Rls,
    Snc,
}

impl MuxCommandType {
    // Already include EA=1, per the §6 "after masking CR" table.
    const PN: u8 = 0x81;
    const CLD: u8 = 0xC1;
    const PSC: u8 = 0x41;
    const TEST: u8 = 0x21;
    const MSC: u8 = 0xE1;
    const NSC: u8 = 0x11;
    const RPN: u8 = 0x91;
    const RLS: u8 = 0x51;
    const SNC: u8 = 0xD1;

    pub fn from_type_octet(type_octet: u8) -> Option<Self> {
        match type_octet & !CR {
            Self::PN => Some(Self::Pn),
            Self::CLD => Some(Self::Cld),
            Self::PSC => Some(Self::Psc),
            Self::TEST => Some(Self::Test),
            Self::MSC => Some(Self::Msc),
            Self::NSC => Some(Self::Nsc),
            Self::RPN => Some(Self::Rpn),
            Self::RLS => Some(Self::Rls),
            Self::SNC => Some(Self::Snc),
            _ => None,
        }
    }

    fn base(self) -> u8 {
        match self {
            Self::Pn => Self::PN,
            Self::Cld => Self::CLD,
            Self::Psc => Self::PSC,
            Self::Test => Self::TEST,
            Self::Msc => Self::MSC,
            Self::Nsc => Self::NSC,
            Self::Rpn => Self::RPN,
            Self::Rls => Self::RLS,
            Self::Snc => Self::SNC,
        }
    }

    pub fn type_octet(self, command: bool) -> u8 {
        self.base() | if command { CR } else { 0 }
    }
}

/// V.24 signal bits carried in an MSC command, decoded only for logging;
/// the raw byte is what's stored in `Channel::v24_signals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct V24Signals {
    pub fc: bool,
    pub rtc: bool,
    pub ic: bool,
    pub dv: bool,
}

impl V24Signals {
    pub fn decode(byte: u8) -> Self {
        Self {
            fc: byte & 0x02 != 0,
            rtc: byte & 0x04 != 0,
            ic: byte & 0x40 != 0,
            dv: byte & 0x80 != 0,
        }
    }
}

/// What the caller (the `Link`) should do in response to one DLCI-0 UIH
/// payload. `ControlChannelLogic` never touches the serial fd or the
/// channel table directly — it only describes the reaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Transition the link to CLOSING.
    CloseDown,
    /// Update `channels[channel].v24_signals` to `signals`.
    UpdateSignals { channel: u8, signals: u8 },
    /// Send this exact payload as a UIH frame on DLCI 0.
    SendReply(Vec<u8>),
}

/// Parses and reacts to one DLCI 0 UIH payload.
///
/// `enfora` mirrors `Flags::ENFORA`: it's passed in rather than read from
/// a stored `Config` so this stays a pure function of its inputs, easy to
/// exercise in tests.
pub fn handle(payload: &[u8], enfora: bool) -> Vec<ControlAction> {
    let Some(&type_octet) = payload.first() else {
        return vec![];
    };
    let is_command = type_octet & CR != 0;

    if !is_command {
        // A response to one of our own commands. NSC means the peer
        // rejected it, worth a log line; anything else, recognized or
        // not, is just an ack with nothing further to do -- we only
        // ever answer commands, never responses.
        if MuxCommandType::from_type_octet(type_octet) == Some(MuxCommandType::Nsc) {
            log::info!("command not supported by peer: {payload:?}");
        }
        return vec![];
    }

    match MuxCommandType::from_type_octet(type_octet) {
        Some(MuxCommandType::Cld) => {
            let mut reply = payload.to_vec();
            reply[0] &= !CR;
            vec![ControlAction::CloseDown, ControlAction::SendReply(reply)]
        }
        Some(MuxCommandType::Psc) => {
            let mut reply = payload.to_vec();
            reply[0] &= !CR;
            vec![ControlAction::SendReply(reply)]
        }
        Some(MuxCommandType::Test) => {
            let mut reply = payload.to_vec();
            reply[0] &= !CR;
            vec![ControlAction::SendReply(reply)]
        }
        Some(MuxCommandType::Msc) => handle_msc(payload, enfora),
        // PN/RPN/RLS/SNC are recognized type octets, but the grounding
        // source's handle_command switch only special-cases
        // CLD/PSC/TEST/MSC -- everything else, recognized or not, falls
        // into its default: NSC path with no ack.
        _ => {
            let reply = build_nsc_reply(payload);
            vec![ControlAction::SendReply(reply)]
        }
    }
}

fn handle_msc(payload: &[u8], enfora: bool) -> Vec<ControlAction> {
    // Payload layout: [type, length, dlci-and-addr-bits, signals, ...].
    // We only need the DLCI (bits 2-7 of the address-style byte at index
    // 2) and the signal byte that follows it.
    if payload.len() < 4 {
        return vec![];
    }
    let type_octet = payload[0];
    let channel = (payload[2] >> 2) & 0x3F;
    let signals = payload[3];
    log::debug!("MSC channel {channel}: {:?}", V24Signals::decode(signals));

    let poll_final_set = type_octet & 0x10 != 0;

    let mut reply = payload.to_vec();
    reply[0] &= !CR;
    if enfora && poll_final_set {
        reply[0] |= 0x10;
    }

    let mut actions = vec![
        ControlAction::UpdateSignals { channel, signals },
        ControlAction::SendReply(reply),
    ];

    if enfora && poll_final_set {
        let mut resend = payload.to_vec();
        resend[0] |= CR;
        actions.push(ControlAction::SendReply(resend));
    }

    actions
}

fn build_nsc_reply(payload: &[u8]) -> Vec<u8> {
    let mut reply = vec![MuxCommandType::Nsc.type_octet(false)];
    if let Some(&orig) = payload.first() {
        reply.push(orig);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_acks_by_echo() {
        let payload = vec![MuxCommandType::Test.type_octet(true), 0x03, b'h', b'i'];
        let actions = handle(&payload, false);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ControlAction::SendReply(reply) => {
                assert_eq!(reply[0], MuxCommandType::Test.type_octet(false));
                assert_eq!(&reply[1..], &payload[1..]);
            }
            other => panic!("expected SendReply, got {other:?}"),
        }
    }

    #[test]
    fn cld_command_closes_down_and_acks() {
        let payload = vec![MuxCommandType::Cld.type_octet(true), 0x01];
        let actions = handle(&payload, false);
        assert!(actions.contains(&ControlAction::CloseDown));
        match actions.iter().find(|a| matches!(a, ControlAction::SendReply(_))) {
            Some(ControlAction::SendReply(reply)) => {
                assert_eq!(reply[0], MuxCommandType::Cld.type_octet(false));
            }
            _ => panic!("expected an ack SendReply alongside CloseDown"),
        }
    }

    #[test]
    fn psc_command_acks_with_no_other_effect() {
        let payload = vec![MuxCommandType::Psc.type_octet(true), 0x01];
        let actions = handle(&payload, false);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ControlAction::SendReply(reply) => {
                assert_eq!(reply[0], MuxCommandType::Psc.type_octet(false));
            }
            other => panic!("expected SendReply, got {other:?}"),
        }
    }

    #[test]
    fn msc_updates_signals_and_acks() {
        let channel = 5u8;
        let addr_byte = (channel << 2) | EA;
        let signals = 0x8D; // DV|RTR|RTC|EA-ish bit pattern
        let payload = vec![MuxCommandType::Msc.type_octet(true), 0x05, addr_byte, signals];
        let actions = handle(&payload, false);
        assert!(actions.contains(&ControlAction::UpdateSignals { channel, signals }));
        assert!(actions.iter().any(|a| matches!(a, ControlAction::SendReply(_))));
    }

    #[test]
    fn enfora_resends_msc_as_command_when_pf_set() {
        let channel = 2u8;
        let addr_byte = (channel << 2) | EA;
        let signals = 0x8D;
        let payload = vec![
            MuxCommandType::Msc.type_octet(true) | 0x10,
            0x05,
            addr_byte,
            signals,
        ];
        let actions = handle(&payload, true);
        let replies: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                ControlAction::SendReply(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0][0] & 0x10, 0x10, "ack must echo P/F");
        assert_eq!(replies[1][0] & CR, CR, "resend must be a command");
    }

    #[test]
    fn non_enfora_does_not_resend_msc() {
        let channel = 2u8;
        let addr_byte = (channel << 2) | EA;
        let payload = vec![
            MuxCommandType::Msc.type_octet(true) | 0x10,
            0x05,
            addr_byte,
            0x8D,
        ];
        let actions = handle(&payload, false);
        let reply_count = actions
            .iter()
            .filter(|a| matches!(a, ControlAction::SendReply(_)))
            .count();
        assert_eq!(reply_count, 1);
    }

    #[test]
    fn unknown_command_gets_nsc_and_no_ack() {
        let payload = vec![0x70 | CR | EA, 0x01];
        let actions = handle(&payload, false);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ControlAction::SendReply(reply) => {
                assert_eq!(reply[0], MuxCommandType::Nsc.type_octet(false));
            }
            other => panic!("expected NSC SendReply, got {other:?}"),
        }
    }

    #[test]
    fn pn_rpn_rls_snc_are_not_acked_just_nsced() {
        for cmd in [MuxCommandType::Pn, MuxCommandType::Rpn, MuxCommandType::Rls, MuxCommandType::Snc] {
            let payload = vec![cmd.type_octet(true), 0x01];
            let actions = handle(&payload, false);
            assert_eq!(actions.len(), 1, "{cmd:?} should get exactly one action");
            match &actions[0] {
                ControlAction::SendReply(reply) => {
                    assert_eq!(reply[0], MuxCommandType::Nsc.type_octet(false), "{cmd:?} should be NSC'd, not acked");
                }
                other => panic!("expected NSC SendReply for {cmd:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn nsc_response_is_logged_not_acked() {
        let payload = vec![MuxCommandType::Nsc.type_octet(false), 0x21];
        assert_eq!(handle(&payload, false), vec![]);
    }

    #[test]
    fn plain_response_is_a_noop_ack() {
        let payload = vec![MuxCommandType::Test.type_octet(false), b'h'];
        assert_eq!(handle(&payload, false), vec![]);
    }

    #[test]
    fn unrecognized_response_is_silently_ignored() {
        let payload = vec![0x70 | EA, 0x01]; // CR=0: a response, not a command
        assert_eq!(handle(&payload, false), vec![]);
    }

    #[test]
    fn v24_signals_decode_matches_original_masks() {
        let signals = V24Signals::decode(0x02 | 0x04 | 0x40 | 0x80);
        assert!(signals.fc);
        assert!(signals.rtc);
        assert!(signals.ic);
        assert!(signals.dv);
        assert_eq!(V24Signals::decode(0x00), V24Signals::default());
    }
}
