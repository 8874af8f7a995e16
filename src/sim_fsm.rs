//! The SIM FSM: discovers the UIM slot/card, unlocks PIN/PUK, and reads
//! the IMSI. Runs as a child of the Modem FSM — `run` is spawned once
//! from `MODEM_ST_WAIT_UIM` and its return value stands in for the
//! `SIM_READY` / `SIM_TERM` events the original dispatches to its
//! parent.

use bytes::Buf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::codec::uim::{self, AppState, CardState, PinId, PinState, SlotState};
use crate::codec::{dms, ServiceId};
use crate::modem::{Modem, SimState};
use crate::registry::RequestOutcome;
use crate::transport::DeviceHandle;

/// How many times `GET_INFO` re-polls `Get-Slot-Status` while waiting for
/// a card to be seated before giving up with `NO_SIM_PRESENT`. Not named
/// by the QMI source (which polls indefinitely on a udev-style insert
/// event); picked as a finite bound for a bring-up sequence that has to
/// terminate.
const WAIT_UIM_PRESENT_RETRIES: u32 = 5;
const WAIT_UIM_PRESENT_INTERVAL: Duration = Duration::from_secs(2);

/// Retries below which a PIN/PUK attempt would exhaust the card; mirrors
/// the "retries >= 2" guard in the source so a single bad attempt never
/// permanently blocks a SIM this FSM is driving.
const MIN_RETRIES_TO_ATTEMPT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFsmState {
    Idle,
    GetInfo,
    WaitUimPresent,
    ChvPin,
    ChvPuk,
    Ready,
    FailPinRequired,
    FailPukRequired,
    FailNoSimPresent,
    Failed,
    /// Reached only via `on_card_removed`: a card that was present is
    /// later reported absent. Out of scope for the linear bring-up path
    /// `run` drives; exists so a caller with access to a live UIM
    /// indication stream can report a hot removal.
    Removed,
    Destroy,
}

/// What the SIM FSM dispatches to its parent on termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOutcome {
    Ready,
    PinRequired,
    PukRequired,
    NoSimPresent,
    Failed,
}

pub struct SimFsm {
    state: SimFsmState,
    clock: Arc<dyn Clock>,
    pin_attempted: bool,
    puk_attempted: bool,
}

impl SimFsm {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        SimFsm { state: SimFsmState::Idle, clock, pin_attempted: false, puk_attempted: false }
    }

    pub fn state(&self) -> SimFsmState {
        self.state
    }

    pub fn on_card_removed(&mut self) {
        self.state = SimFsmState::Removed;
    }

    /// Drives the SIM from `IDLE` to a terminal outcome, mutating `modem`'s
    /// `sim` and `identity.{imsi,iccid}` fields as information becomes
    /// available.
    pub async fn run(&mut self, modem: &std::sync::Mutex<Modem>, device: &DeviceHandle) -> SimOutcome {
        self.state = SimFsmState::GetInfo;

        let slot = match self.find_active_slot(device).await {
            Some(slot) => slot,
            None => {
                self.state = SimFsmState::FailNoSimPresent;
                return SimOutcome::NoSimPresent;
            }
        };

        if let Some(iccid) = decode_iccid_bcd(&slot.iccid_raw) {
            modem.lock().unwrap().identity.iccid = Some(iccid);
        }

        let card_status = match device.request(uim::GetCardStatusRequest).await {
            Ok(RequestOutcome::Success(resp)) => resp,
            _ => {
                self.state = SimFsmState::Failed;
                return SimOutcome::Failed;
            }
        };

        let app = card_status
            .cards
            .iter()
            .find(|c| c.card_state == CardState::Present)
            .and_then(|c| c.applications.iter().find(|a| a.app_state != AppState::Unknown));

        let app = match app {
            Some(app) => *app,
            None => {
                self.state = SimFsmState::FailNoSimPresent;
                return SimOutcome::NoSimPresent;
            }
        };

        let use_upin = {
            let m = modem.lock().unwrap();
            m.sim.use_upin
        };
        let (pin_state, pin_retries, puk_retries) = if use_upin {
            (app.upin_state, app.upin_retries, app.upuk_retries)
        } else {
            (app.pin1_state, app.pin1_retries, app.puk1_retries)
        };

        {
            let mut m = modem.lock().unwrap();
            m.sim.pin_retries = Some(pin_retries);
            m.sim.puk_retries = Some(puk_retries);
        }

        match pin_state {
            PinState::Enabled => {
                self.state = SimFsmState::ChvPin;
                return self.try_chv_pin(modem, device, pin_retries, use_upin).await;
            }
            PinState::Blocked | PinState::PermanentlyBlocked => {
                self.state = SimFsmState::ChvPuk;
                return self.try_chv_puk(modem, device, puk_retries, use_upin).await;
            }
            _ => {}
        }

        self.finish_read_imsi(modem, device).await
    }

    async fn find_active_slot(&mut self, device: &DeviceHandle) -> Option<uim::SlotEntry> {
        for attempt in 0..=WAIT_UIM_PRESENT_RETRIES {
            let resp = match device.request(uim::GetSlotStatusRequest).await {
                Ok(RequestOutcome::Success(resp)) => resp,
                _ => return None,
            };
            if let Some(slot) = resp
                .slots
                .into_iter()
                .find(|s| s.card_state == CardState::Present && s.slot_state == SlotState::Active && !s.iccid_raw.is_empty())
            {
                return Some(slot);
            }
            if attempt == WAIT_UIM_PRESENT_RETRIES {
                return None;
            }
            self.state = SimFsmState::WaitUimPresent;
            self.clock.sleep(WAIT_UIM_PRESENT_INTERVAL).await;
            self.state = SimFsmState::GetInfo;
        }
        None
    }

    async fn try_chv_pin(
        &mut self,
        modem: &std::sync::Mutex<Modem>,
        device: &DeviceHandle,
        pin_retries: u8,
        use_upin: bool,
    ) -> SimOutcome {
        let pin = { modem.lock().unwrap().config.pin.clone() };
        if self.pin_attempted || pin_retries < MIN_RETRIES_TO_ATTEMPT || pin.is_none() {
            self.state = SimFsmState::FailPinRequired;
            let mut m = modem.lock().unwrap();
            m.sim.state = SimState::PinRequired;
            m.sim.requires_unlock = true;
            return SimOutcome::PinRequired;
        }
        self.pin_attempted = true;
        let pin_id = if use_upin { PinId::UPin } else { PinId::Pin1 };
        match device.request(uim::VerifyPinRequest { pin_id, pin: pin.unwrap() }).await {
            Ok(RequestOutcome::Success(resp)) => {
                if let Some(retries) = resp.pin_retries {
                    modem.lock().unwrap().sim.pin_retries = Some(retries);
                }
                self.state = SimFsmState::GetInfo;
                Box::pin(self.run(modem, device)).await
            }
            _ => {
                self.state = SimFsmState::FailPinRequired;
                let mut m = modem.lock().unwrap();
                m.sim.state = SimState::PinRequired;
                m.sim.requires_unlock = true;
                SimOutcome::PinRequired
            }
        }
    }

    async fn try_chv_puk(
        &mut self,
        modem: &std::sync::Mutex<Modem>,
        device: &DeviceHandle,
        puk_retries: u8,
        use_upin: bool,
    ) -> SimOutcome {
        let (puk, pin) = {
            let m = modem.lock().unwrap();
            (m.config.puk.clone(), m.config.pin.clone())
        };
        if self.puk_attempted || puk_retries < MIN_RETRIES_TO_ATTEMPT || puk.is_none() || pin.is_none() {
            self.state = SimFsmState::FailPukRequired;
            let mut m = modem.lock().unwrap();
            m.sim.state = SimState::PukRequired;
            m.sim.requires_unlock = true;
            return SimOutcome::PukRequired;
        }
        self.puk_attempted = true;
        let pin_id = if use_upin { PinId::UPin } else { PinId::Pin1 };
        match device
            .request(uim::UnblockPinRequest { pin_id, puk: puk.unwrap(), new_pin: pin.unwrap() })
            .await
        {
            Ok(RequestOutcome::Success(resp)) => {
                if let Some(retries) = resp.puk_retries {
                    modem.lock().unwrap().sim.puk_retries = Some(retries);
                }
                self.state = SimFsmState::GetInfo;
                Box::pin(self.run(modem, device)).await
            }
            _ => {
                self.state = SimFsmState::FailPukRequired;
                let mut m = modem.lock().unwrap();
                m.sim.state = SimState::PukRequired;
                m.sim.requires_unlock = true;
                SimOutcome::PukRequired
            }
        }
    }

    async fn finish_read_imsi(&mut self, modem: &std::sync::Mutex<Modem>, device: &DeviceHandle) -> SimOutcome {
        let imsi = match device.request(uim::ReadTransparentRequest::ef_imsi()).await {
            Ok(RequestOutcome::Success(resp)) => decode_imsi_bcd(&resp.content),
            _ => None,
        };
        let imsi = match imsi {
            Some(imsi) => Some(imsi),
            None => match device.request(dms::GetImsiFallbackRequest).await {
                Ok(RequestOutcome::Success(resp)) => Some(dms::decode_imsi_digits(resp.value.as_bytes())),
                _ => None,
            },
        };

        let mut m = modem.lock().unwrap();
        m.identity.imsi = imsi;
        m.sim.state = SimState::Ready;
        m.sim.requires_unlock = false;
        drop(m);
        self.state = SimFsmState::Ready;
        SimOutcome::Ready
    }
}

/// Decodes an ICCID from a UIM slot-status entry: nibble-swapped BCD, low
/// nibble of each byte decoded before the high nibble, filler `0xF`
/// nibbles truncated. Grounded in `osmo_bcd2str`'s nibble order (the low
/// nibble of byte `i` is nibble `2*i`, decoded first) applied across the
/// whole raw buffer. Rejects an all-filler payload.
pub fn decode_iccid_bcd(raw: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(raw.len() * 2);
    for &byte in raw {
        for nibble in [byte & 0x0f, byte >> 4] {
            if nibble == 0xf {
                continue;
            }
            if nibble > 9 {
                return None;
            }
            out.push((b'0' + nibble) as char);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Decodes an EF.IMSI transparent-file read: byte 0 is the encoded
/// length in bytes (1-8), bit 3 of byte 1 is the odd/even digit-count
/// flag, and the digits themselves are BCD nibbles starting at nibble 1
/// of the remaining bytes (nibble 0 of byte 1 carries the odd/even flag
/// and service-table bits, not a digit). Matches the real UIM file
/// layout this crate's tests round-trip against.
pub fn decode_imsi_bcd(ef: &[u8]) -> Option<String> {
    if ef.len() < 2 {
        return None;
    }
    let mut buf = ef;
    let enc_len = buf.get_u8() as usize;
    if enc_len == 0 || enc_len > 8 || buf.len() < enc_len {
        return None;
    }
    let mut digit_count = enc_len * 2 - 1;
    let odd_even = (buf[0] >> 3) & 0x1;
    if odd_even == 0 {
        digit_count -= 1;
    }

    let mut out = String::with_capacity(digit_count);
    for nibble_i in 1..=digit_count {
        let byte_idx = nibble_i / 2;
        if byte_idx >= buf.len() {
            return None;
        }
        let byte = buf[byte_idx];
        let nibble = if nibble_i % 2 == 1 { byte >> 4 } else { byte & 0x0f };
        if nibble > 9 {
            return None;
        }
        out.push((b'0' + nibble) as char);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imsi_bcd_matches_known_vector() {
        let ef = [0x08u8, 0x29, 0x82, 0x60, 0x82, 0x00, 0x00, 0x20, 0x80];
        assert_eq!(decode_imsi_bcd(&ef), Some("228062800000208".to_string()));
    }

    #[test]
    fn iccid_bcd_truncates_trailing_filler() {
        let raw = [0x89u8, 0x86, 0x00, 0x18, 0xff];
        let decoded = decode_iccid_bcd(&raw).unwrap();
        assert_eq!(decoded, "98680081");
    }

    #[test]
    fn iccid_all_filler_is_rejected() {
        let raw = [0xffu8, 0xff];
        assert_eq!(decode_iccid_bcd(&raw), None);
    }

    #[test]
    fn imsi_even_digit_count_drops_one_digit() {
        // enc_len=8 -> 15 digits by default; clearing the odd/even bit
        // should yield 14.
        let mut ef = [0x08u8, 0x29, 0x82, 0x60, 0x82, 0x00, 0x00, 0x20, 0x80];
        ef[1] &= !0x08;
        let decoded = decode_imsi_bcd(&ef).unwrap();
        assert_eq!(decoded.len(), 14);
    }
}
