//! # Attestation変換
//!
//! 外部レスポンス（Verification Serviceのコラテラル、TEEのTCB情報JSON）を
//! 生の [`Attestation`] にデコードし、コントラクト向けの
//! [`ContractAttestation`] にエンコードする。
//!
//! 各外部レスポンスのデコード関数はここに1つずつ置く。欠損フィールドは
//! 空文字列・空配列・ゼロ埋めとして扱い、nullにはしない。

use shade_crypto::encoding::hex_to_array;
use shade_crypto::{bytes_to_hex, hex_to_bytes, DecodeError};
use shade_types::{
    Attestation, Collateral, ContractAttestation, ContractCollateral, ContractEventLog,
    ContractTcbInfo, EventLogEntry, TcbInfo, WireCollateral, WireEventLog, WireTcbInfo,
};

fn text(field: &Option<String>) -> String {
    field.clone().unwrap_or_default()
}

fn bytes(field: &Option<String>) -> Result<Vec<u8>, DecodeError> {
    hex_to_bytes(field.as_deref().unwrap_or_default())
}

// ---------------------------------------------------------------------------
// デコード（外部 → 生データ）
// ---------------------------------------------------------------------------

/// Verification Serviceのコラテラルをデコードする。
pub fn collateral_from_wire(wire: &WireCollateral) -> Result<Collateral, DecodeError> {
    Ok(Collateral {
        pck_crl_issuer_chain: text(&wire.pck_crl_issuer_chain),
        root_ca_crl: bytes(&wire.root_ca_crl)?,
        pck_crl: bytes(&wire.pck_crl)?,
        tcb_info_issuer_chain: text(&wire.tcb_info_issuer_chain),
        tcb_info: text(&wire.tcb_info),
        tcb_info_signature: bytes(&wire.tcb_info_signature)?,
        qe_identity_issuer_chain: text(&wire.qe_identity_issuer_chain),
        qe_identity: text(&wire.qe_identity),
        qe_identity_signature: bytes(&wire.qe_identity_signature)?,
        pck_certificate_chain: text(&wire.pck_certificate_chain),
    })
}

/// TEEの `/Info` に含まれるTCB情報をデコードする。
pub fn tcb_info_from_wire(wire: &WireTcbInfo) -> Result<TcbInfo, DecodeError> {
    let measurement = |field: &'static str, value: &Option<String>| {
        hex_to_array(field, value.as_deref().unwrap_or_default())
    };
    Ok(TcbInfo {
        mrtd: measurement("mrtd", &wire.mrtd)?,
        rtmr0: measurement("rtmr0", &wire.rtmr0)?,
        rtmr1: measurement("rtmr1", &wire.rtmr1)?,
        rtmr2: measurement("rtmr2", &wire.rtmr2)?,
        rtmr3: measurement("rtmr3", &wire.rtmr3)?,
        os_image_hash: bytes(&wire.os_image_hash)?,
        compose_hash: hex_to_array("compose_hash", wire.compose_hash.as_deref().unwrap_or_default())?,
        device_id: hex_to_array("device_id", wire.device_id.as_deref().unwrap_or_default())?,
        app_compose: text(&wire.app_compose),
        event_log: wire
            .event_log
            .iter()
            .map(event_from_wire)
            .collect::<Result<_, _>>()?,
    })
}

fn event_from_wire(wire: &WireEventLog) -> Result<EventLogEntry, DecodeError> {
    Ok(EventLogEntry {
        imr: wire.imr,
        event_type: wire.event_type,
        digest: bytes(&wire.digest)?,
        event: text(&wire.event),
        event_payload: bytes(&wire.event_payload)?,
    })
}

// ---------------------------------------------------------------------------
// エンコード（生データ ⇄ コントラクト形式）
// ---------------------------------------------------------------------------

/// コントラクト向けの形式にエンコードする。
///
/// checksumはコントラクトに送らない。
pub fn to_contract_attestation(attestation: &Attestation) -> ContractAttestation {
    let c = &attestation.collateral;
    let t = &attestation.tcb_info;
    ContractAttestation {
        quote: bytes_to_hex(&attestation.quote),
        collateral: ContractCollateral {
            pck_crl_issuer_chain: c.pck_crl_issuer_chain.clone(),
            root_ca_crl: bytes_to_hex(&c.root_ca_crl),
            pck_crl: bytes_to_hex(&c.pck_crl),
            tcb_info_issuer_chain: c.tcb_info_issuer_chain.clone(),
            tcb_info: c.tcb_info.clone(),
            tcb_info_signature: bytes_to_hex(&c.tcb_info_signature),
            qe_identity_issuer_chain: c.qe_identity_issuer_chain.clone(),
            qe_identity: c.qe_identity.clone(),
            qe_identity_signature: bytes_to_hex(&c.qe_identity_signature),
            pck_certificate_chain: c.pck_certificate_chain.clone(),
        },
        tcb_info: ContractTcbInfo {
            mrtd: bytes_to_hex(&t.mrtd),
            rtmr0: bytes_to_hex(&t.rtmr0),
            rtmr1: bytes_to_hex(&t.rtmr1),
            rtmr2: bytes_to_hex(&t.rtmr2),
            rtmr3: bytes_to_hex(&t.rtmr3),
            os_image_hash: bytes_to_hex(&t.os_image_hash),
            compose_hash: bytes_to_hex(&t.compose_hash),
            device_id: bytes_to_hex(&t.device_id),
            app_compose: t.app_compose.clone(),
            event_log: t
                .event_log
                .iter()
                .map(|e| ContractEventLog {
                    imr: e.imr,
                    event_type: e.event_type,
                    digest: bytes_to_hex(&e.digest),
                    event: e.event.clone(),
                    event_payload: bytes_to_hex(&e.event_payload),
                })
                .collect(),
        },
    }
}

/// [`to_contract_attestation`] の逆変換。
pub fn from_contract_attestation(
    contract: &ContractAttestation,
) -> Result<Attestation, DecodeError> {
    let c = &contract.collateral;
    let t = &contract.tcb_info;
    Ok(Attestation {
        quote: hex_to_bytes(&contract.quote)?,
        collateral: Collateral {
            pck_crl_issuer_chain: c.pck_crl_issuer_chain.clone(),
            root_ca_crl: hex_to_bytes(&c.root_ca_crl)?,
            pck_crl: hex_to_bytes(&c.pck_crl)?,
            tcb_info_issuer_chain: c.tcb_info_issuer_chain.clone(),
            tcb_info: c.tcb_info.clone(),
            tcb_info_signature: hex_to_bytes(&c.tcb_info_signature)?,
            qe_identity_issuer_chain: c.qe_identity_issuer_chain.clone(),
            qe_identity: c.qe_identity.clone(),
            qe_identity_signature: hex_to_bytes(&c.qe_identity_signature)?,
            pck_certificate_chain: c.pck_certificate_chain.clone(),
        },
        tcb_info: TcbInfo {
            mrtd: hex_to_array("mrtd", &t.mrtd)?,
            rtmr0: hex_to_array("rtmr0", &t.rtmr0)?,
            rtmr1: hex_to_array("rtmr1", &t.rtmr1)?,
            rtmr2: hex_to_array("rtmr2", &t.rtmr2)?,
            rtmr3: hex_to_array("rtmr3", &t.rtmr3)?,
            os_image_hash: hex_to_bytes(&t.os_image_hash)?,
            compose_hash: hex_to_array("compose_hash", &t.compose_hash)?,
            device_id: hex_to_array("device_id", &t.device_id)?,
            app_compose: t.app_compose.clone(),
            event_log: t
                .event_log
                .iter()
                .map(|e| {
                    Ok(EventLogEntry {
                        imr: e.imr,
                        event_type: e.event_type,
                        digest: hex_to_bytes(&e.digest)?,
                        event: e.event.clone(),
                        event_payload: hex_to_bytes(&e.event_payload)?,
                    })
                })
                .collect::<Result<_, DecodeError>>()?,
        },
        checksum: String::new(),
    })
}

/// TEE外で使うプレースホルダAttestation。
///
/// quote・コラテラルは空、測定レジスタはゼロ埋め。呼び出しごとに同一。
pub fn fake_attestation() -> Attestation {
    Attestation::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::mock::mock_tcb_info_json;

    fn sample_attestation() -> Attestation {
        let wire: WireTcbInfo = serde_json::from_str(&mock_tcb_info_json()).unwrap();
        Attestation {
            quote: vec![0x04, 0x00, 0x02, 0x00, 0x81],
            collateral: Collateral {
                pck_crl_issuer_chain: "-----BEGIN CERTIFICATE-----".into(),
                root_ca_crl: vec![0x30, 0x82],
                pck_crl: vec![0x30, 0x81],
                tcb_info_issuer_chain: "chain".into(),
                tcb_info: "{\"id\":\"TDX\"}".into(),
                tcb_info_signature: vec![0xaa; 64],
                qe_identity_issuer_chain: "chain".into(),
                qe_identity: "{\"id\":\"TD_QE\"}".into(),
                qe_identity_signature: vec![0xbb; 64],
                pck_certificate_chain: String::new(),
            },
            tcb_info: tcb_info_from_wire(&wire).unwrap(),
            checksum: String::new(),
        }
    }

    #[test]
    fn test_contract_roundtrip() {
        let attestation = sample_attestation();
        let contract = to_contract_attestation(&attestation);
        assert_eq!(contract.quote, "0400020081");
        assert_eq!(contract.tcb_info.mrtd, "01".repeat(48));
        assert_eq!(contract.tcb_info.event_log[0].event, "compose-hash");

        let decoded = from_contract_attestation(&contract).unwrap();
        assert_eq!(decoded, attestation);
    }

    /// プレースホルダは固定幅のゼロ埋めで、呼び出しごとに同一であることを確認
    #[test]
    fn test_fake_attestation_is_canonical() {
        let a = to_contract_attestation(&fake_attestation());
        let b = to_contract_attestation(&fake_attestation());
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());

        assert!(a.quote.is_empty());
        for m in [&a.tcb_info.mrtd, &a.tcb_info.rtmr0, &a.tcb_info.rtmr3] {
            assert_eq!(m.len(), 96);
            assert!(m.chars().all(|c| c == '0'));
        }
        assert_eq!(a.tcb_info.compose_hash, "0".repeat(64));
        assert_eq!(a.tcb_info.device_id, "0".repeat(64));
        assert!(a.collateral.root_ca_crl.is_empty());
        assert!(a.tcb_info.event_log.is_empty());
    }

    /// 欠損フィールドが空文字列として出力されることを確認
    #[test]
    fn test_missing_collateral_fields_become_empty() {
        let wire = WireCollateral {
            tcb_info: Some("{}".into()),
            pck_crl: Some("0x3081".into()),
            ..Default::default()
        };
        let collateral = collateral_from_wire(&wire).unwrap();
        assert_eq!(collateral.tcb_info, "{}");
        assert_eq!(collateral.pck_crl, vec![0x30, 0x81]);
        assert!(collateral.root_ca_crl.is_empty());
        assert!(collateral.pck_certificate_chain.is_empty());

        let value = serde_json::to_value(to_contract_attestation(&Attestation {
            collateral,
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(value["collateral"]["root_ca_crl"], "");
        assert_eq!(value["collateral"]["pck_crl"], "3081");
    }

    #[test]
    fn test_wrong_measurement_width_is_rejected() {
        let wire = WireTcbInfo {
            mrtd: Some("0102".into()),
            ..Default::default()
        };
        let err = tcb_info_from_wire(&wire).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InvalidLength {
                field: "mrtd",
                expected: 48,
                actual: 2
            }
        );
    }
}
