//! # 鍵導出とローテーション
//!
//! エージェントのID鍵生成、追加鍵の導出、レジャー上のアクセスキー一覧との
//! 突き合わせ、ラウンドロビンでの署名鍵選択を行う。
//!
//! ## 鍵の来歴
//! | 条件 | ID鍵 | 追加鍵（index i） | TEE由来 |
//! |------|------|------------------|--------|
//! | TEEあり | `get_key(base)` | `get_key("{base}-{i}")` | ○ |
//! | 導出パスのみ | HKDF(path) | HKDF("{path}-{i}") | × |
//! | どちらもなし | OsRng | OsRng | × |
//!
//! TEEありで導出パスがない場合、`base` は起動ごとのランダムなラベルになる。

use shade_crypto::{AgentKey, PublicKey};

use crate::error::AgentError;
use crate::ledger::LedgerConnection;
use crate::tee::TeeClient;
use crate::transaction;

/// エージェントのID鍵。
#[derive(Debug, Clone)]
pub struct Identity {
    /// ID鍵（鍵プールのindex 0）
    pub key: AgentKey,
    /// implicit account ID
    pub account_id: String,
    /// TEEの鍵素材から導出したか
    pub derived_with_tee: bool,
    /// 追加鍵のサブパスの基点
    pub derivation_base: Option<String>,
}

/// ID鍵を生成する。
pub async fn generate_identity(
    tee: Option<&dyn TeeClient>,
    path: Option<&str>,
) -> Result<Identity, AgentError> {
    let (key, derived_with_tee, derivation_base) = match (tee, path) {
        (Some(tee), path) => {
            let base = match path {
                Some(p) => p.to_string(),
                None => shade_crypto::bytes_to_hex(&shade_crypto::random_bytes32()),
            };
            let material = tee.get_key(&base).await?;
            let seed = shade_crypto::seed_from_tee_key_material(&material)?;
            (AgentKey::from_seed(&seed), true, Some(base))
        }
        (None, Some(path)) => {
            let seed = shade_crypto::seed_from_derivation_path(path)?;
            (AgentKey::from_seed(&seed), false, Some(path.to_string()))
        }
        (None, None) => (AgentKey::generate(), false, None),
    };

    let account_id = key.account_id();
    tracing::info!(
        account_id = %account_id,
        public_key = %key.public_key(),
        derived_with_tee,
        "ID鍵を生成しました"
    );

    Ok(Identity {
        key,
        account_id,
        derived_with_tee,
        derivation_base,
    })
}

/// index `first_index` から `count` 個の追加鍵を導出する。
///
/// 戻り値の真偽値は全ての鍵がTEE由来かどうか。
pub async fn derive_keys_at(
    first_index: usize,
    count: usize,
    tee: Option<&dyn TeeClient>,
    base: Option<&str>,
) -> Result<(Vec<AgentKey>, bool), AgentError> {
    let mut keys = Vec::with_capacity(count);
    for index in first_index..first_index + count {
        let key = match (tee, base) {
            (Some(tee), Some(base)) => {
                let material = tee.get_key(&format!("{base}-{index}")).await?;
                AgentKey::from_seed(&shade_crypto::seed_from_tee_key_material(&material)?)
            }
            (None, Some(base)) => AgentKey::from_seed(&shade_crypto::seed_from_derivation_path(
                &format!("{base}-{index}"),
            )?),
            (_, None) => AgentKey::generate(),
        };
        keys.push(key);
    }
    let with_tee = tee.is_some() && base.is_some();
    Ok((keys, with_tee))
}

/// index 1から `count` 個の追加鍵を導出する。
pub async fn derive_additional_keys(
    count: usize,
    tee: Option<&dyn TeeClient>,
    base: Option<&str>,
) -> Result<(Vec<AgentKey>, bool), AgentError> {
    derive_keys_at(1, count, tee, base).await
}

// ---------------------------------------------------------------------------
// 鍵プール
// ---------------------------------------------------------------------------

/// エージェントの鍵プール。
///
/// `ShadeAgent` の非同期Mutexが所有する。
#[derive(Debug)]
pub struct KeyPool {
    /// 署名鍵（index 0 = ID鍵）
    pub keys: Vec<AgentKey>,
    /// 直近に使った鍵のindex
    pub current_index: usize,
    /// 全ての鍵がTEE由来か（一度falseになったら戻らない）
    pub derived_with_tee: bool,
    /// ID鍵がTEE由来か
    pub identity_with_tee: bool,
    /// 追加鍵のサブパスの基点
    pub derivation_base: Option<String>,
    /// レジャーとの突き合わせ済みか
    pub checked: bool,
}

impl KeyPool {
    /// ID鍵のみの鍵プールを作る。
    pub fn new(identity: Identity) -> Self {
        Self {
            keys: vec![identity.key],
            current_index: 0,
            derived_with_tee: identity.derived_with_tee,
            identity_with_tee: identity.derived_with_tee,
            derivation_base: identity.derivation_base,
            checked: false,
        }
    }

    /// ID鍵。
    pub fn identity(&self) -> Result<&AgentKey, AgentError> {
        self.keys.first().ok_or(AgentError::NoKeysAvailable)
    }

    /// 公開鍵の一覧（プール順）。
    pub fn public_keys(&self) -> Vec<PublicKey> {
        self.keys.iter().map(AgentKey::public_key).collect()
    }
}

/// [`ensure_keys_setup`] の結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySetup {
    /// レジャーに追加した鍵
    pub keys_to_add: Vec<PublicKey>,
    /// レジャーから削除した鍵
    pub keys_removed: Vec<PublicKey>,
    /// 鍵プールが全てTEE由来か
    pub added_with_tee: bool,
    /// 既に突き合わせ済みだったか
    pub was_checked: bool,
}

/// 鍵プールをレジャーのアクセスキー一覧と突き合わせる。
///
/// インスタンスごとに一度だけ実行する（成功後は即座に返る）。
///
/// 1. 来歴チェック（ID鍵がTEE由来なのに追加鍵をTEEで導出できない場合はエラー）
/// 2. 鍵プールを `num_keys` 個に揃える（不足は導出、超過は新しい順に外す）
/// 3. レジャーにない鍵を追加し、プールから外した鍵を削除する
///
/// プールにないレジャー上の鍵は、同じ導出パスでこのエージェントが以前導出した
/// ものだけを削除する（`num_keys` を減らして再起動した場合）。それ以外の鍵
/// （運用者が追加した復旧用の鍵など）には触れない。
pub async fn ensure_keys_setup(
    pool: &mut KeyPool,
    ledger: &dyn LedgerConnection,
    tee: Option<&dyn TeeClient>,
    account_id: &str,
    num_keys: usize,
) -> Result<KeySetup, AgentError> {
    if pool.checked {
        return Ok(KeySetup {
            keys_to_add: Vec::new(),
            keys_removed: Vec::new(),
            added_with_tee: pool.derived_with_tee,
            was_checked: true,
        });
    }

    // 1. 来歴チェック（導出・レジャー操作より前）
    let need = num_keys.max(1);
    if pool.identity_with_tee && pool.keys.len() < need {
        if tee.is_none() {
            return Err(AgentError::KeyProvenance(
                "ID鍵はTEE由来ですが、追加鍵の導出にTEEを利用できません".into(),
            ));
        }
        if pool.derivation_base.is_none() {
            return Err(AgentError::KeyProvenance(
                "ID鍵はTEE由来ですが、追加鍵の導出パスがありません".into(),
            ));
        }
    }

    // 2. 鍵プールを揃える
    let derived_end = pool.keys.len().max(need);
    let mut excess = Vec::new();
    if pool.keys.len() < need {
        let first = pool.keys.len();
        let (new_keys, with_tee) =
            derive_keys_at(first, need - first, tee, pool.derivation_base.as_deref()).await?;
        pool.derived_with_tee &= with_tee;
        pool.keys.extend(new_keys);
    } else if pool.keys.len() > need {
        excess = pool.keys.split_off(need);
        excess.reverse();
    }

    // 3. レジャーと突き合わせる
    let on_chain = ledger.access_keys(account_id).await?;
    let local = pool.public_keys();

    let keys_to_add: Vec<PublicKey> = local
        .iter()
        .filter(|k| !on_chain.contains(k))
        .copied()
        .collect();

    let mut keys_removed: Vec<PublicKey> = excess
        .iter()
        .map(AgentKey::public_key)
        .filter(|k| on_chain.contains(k))
        .collect();
    let unknown: Vec<PublicKey> = on_chain
        .iter()
        .filter(|k| !local.contains(k) && !keys_removed.contains(k))
        .copied()
        .collect();
    if !unknown.is_empty() {
        let mut stale =
            previously_derived(&unknown, derived_end, tee, pool.derivation_base.as_deref()).await?;
        stale.sort();
        let kept = unknown.len() - stale.len();
        if kept > 0 {
            tracing::debug!(account_id, kept, "エージェントが導出していないアクセスキーを残します");
        }
        keys_removed.extend(stale);
    }

    let signer = pool.identity()?.clone();
    if !keys_to_add.is_empty() {
        transaction::add_keys(ledger, account_id, &signer, &keys_to_add).await?;
    }
    if !keys_removed.is_empty() {
        transaction::remove_keys(ledger, account_id, &signer, &keys_removed).await?;
    }

    if pool.current_index >= pool.keys.len() {
        pool.current_index = 0;
    }
    pool.checked = true;

    tracing::info!(
        account_id,
        total = pool.keys.len(),
        added = keys_to_add.len(),
        removed = keys_removed.len(),
        with_tee = pool.derived_with_tee,
        "鍵プールをレジャーと同期しました"
    );

    Ok(KeySetup {
        keys_to_add,
        keys_removed,
        added_with_tee: pool.derived_with_tee,
        was_checked: false,
    })
}

/// `unknown` のうち、index `first_index` 以降の導出鍵と一致するものを返す。
///
/// 以前の導出鍵はindex 1から連続しているので、`unknown.len()` 個先まで見れば足りる。
/// 導出パスがない（ランダム鍵）場合は照合できないので何も返さない。
async fn previously_derived(
    unknown: &[PublicKey],
    first_index: usize,
    tee: Option<&dyn TeeClient>,
    base: Option<&str>,
) -> Result<Vec<PublicKey>, AgentError> {
    if base.is_none() {
        return Ok(Vec::new());
    }
    let (candidates, _) = derive_keys_at(first_index, unknown.len(), tee, base).await?;
    Ok(candidates
        .iter()
        .map(AgentKey::public_key)
        .filter(|k| unknown.contains(k))
        .collect())
}

/// 選択された署名鍵。
#[derive(Debug)]
pub struct SelectedSigner<'a> {
    /// 署名鍵
    pub key: &'a AgentKey,
    /// 次回の `current_index`
    pub next_index: usize,
}

/// ラウンドロビンで署名鍵を選ぶ。
///
/// 鍵が1つならindex 0、複数なら `(current_index + 1) % len`。
pub fn select_signer(keys: &[AgentKey], current_index: usize) -> Result<SelectedSigner<'_>, AgentError> {
    let index = match keys.len() {
        0 => return Err(AgentError::NoKeysAvailable),
        1 => 0,
        len => (current_index + 1) % len,
    };
    Ok(SelectedSigner {
        key: &keys[index],
        next_index: index,
    })
}

#[cfg(test)]
mod tests {
    use shade_types::Network;

    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::Action;
    use crate::tee::mock::MockTee;

    #[tokio::test]
    async fn test_identity_with_tee_is_keyed_by_path() {
        let tee = MockTee::new();
        let a = generate_identity(Some(&tee), Some("agent")).await.unwrap();
        let b = generate_identity(Some(&tee), Some("agent")).await.unwrap();
        let c = generate_identity(Some(&tee), Some("other")).await.unwrap();
        assert!(a.derived_with_tee);
        assert_eq!(a.account_id, b.account_id);
        assert_ne!(a.account_id, c.account_id);

        // 別アプリケーションのTEEからは別の鍵
        let other_app = MockTee::with_seed([0x22; 32]);
        let d = generate_identity(Some(&other_app), Some("agent")).await.unwrap();
        assert_ne!(a.account_id, d.account_id);
    }

    #[tokio::test]
    async fn test_identity_with_tee_without_path_uses_fresh_label() {
        let tee = MockTee::new();
        let a = generate_identity(Some(&tee), None).await.unwrap();
        let b = generate_identity(Some(&tee), None).await.unwrap();
        assert!(a.derived_with_tee);
        assert_ne!(a.account_id, b.account_id);
        assert_eq!(a.derivation_base.as_ref().map(String::len), Some(64));
    }

    #[tokio::test]
    async fn test_identity_from_path_is_deterministic() {
        let a = generate_identity(None, Some("agent")).await.unwrap();
        let b = generate_identity(None, Some("agent")).await.unwrap();
        assert!(!a.derived_with_tee);
        assert_eq!(a.account_id, b.account_id);
        assert_eq!(a.account_id.len(), 64);
        assert!(a.account_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_identity_random() {
        let a = generate_identity(None, None).await.unwrap();
        let b = generate_identity(None, None).await.unwrap();
        assert!(!a.derived_with_tee);
        assert_ne!(a.account_id, b.account_id);
        assert_eq!(a.account_id, a.key.account_id());
    }

    /// サブパスごとに異なる鍵が決定論的に導出されることを確認
    #[tokio::test]
    async fn test_derive_additional_keys() {
        let tee = MockTee::new();
        let (a, with_tee) = derive_additional_keys(3, Some(&tee), Some("agent")).await.unwrap();
        let (b, _) = derive_additional_keys(3, Some(&tee), Some("agent")).await.unwrap();
        assert!(with_tee);
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
        assert_eq!(tee.get_key_calls(), 6);

        let identity = generate_identity(Some(&tee), Some("agent")).await.unwrap();
        assert!(!a.contains(&identity.key));

        let (c, with_tee) = derive_additional_keys(2, None, Some("agent")).await.unwrap();
        assert!(!with_tee);
        assert_ne!(c[0], a[0]);
    }

    async fn funded_pool(ledger: &MockLedger, tee: Option<&dyn TeeClient>) -> (KeyPool, String) {
        let identity = generate_identity(tee, Some("agent")).await.unwrap();
        let account_id = identity.account_id.clone();
        ledger.add_account(&account_id, 1, vec![identity.key.public_key()]);
        (KeyPool::new(identity), account_id)
    }

    #[tokio::test]
    async fn test_ensure_keys_setup_adds_shortfall_once() {
        let ledger = MockLedger::new(Network::Testnet);
        let tee = MockTee::new();
        let (mut pool, account_id) = funded_pool(&ledger, Some(&tee)).await;

        let setup = ensure_keys_setup(&mut pool, &ledger, Some(&tee), &account_id, 3)
            .await
            .unwrap();
        assert!(!setup.was_checked);
        assert!(setup.added_with_tee);
        assert_eq!(setup.keys_to_add.len(), 2);
        assert!(setup.keys_removed.is_empty());
        assert_eq!(pool.keys.len(), 3);
        assert_eq!(ledger.keys_of(&account_id), pool.public_keys());

        let sent = ledger.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].actions.iter().all(|a| matches!(a, Action::AddKey { .. })));
        assert_eq!(sent[0].signer, pool.keys[0].public_key());

        let again = ensure_keys_setup(&mut pool, &ledger, Some(&tee), &account_id, 3)
            .await
            .unwrap();
        assert!(again.was_checked);
        assert!(again.keys_to_add.is_empty());
        assert_eq!(ledger.access_key_queries(), 1);
        assert_eq!(ledger.sent().len(), 1);
    }

    /// 超過した鍵と、以前導出した鍵だけが削除されることを確認
    #[tokio::test]
    async fn test_ensure_keys_setup_removes_excess_and_previously_derived() {
        let ledger = MockLedger::new(Network::Testnet);
        let (mut pool, account_id) = funded_pool(&ledger, None).await;
        let (extra, _) = derive_additional_keys(3, None, Some("agent")).await.unwrap();
        let operator = AgentKey::from_seed(&[0x77; 32]).public_key();
        let mut on_chain = vec![pool.keys[0].public_key(), operator];
        on_chain.extend(extra.iter().map(AgentKey::public_key));
        ledger.add_account(&account_id, 1, on_chain);
        // index 3の鍵は前回の起動で追加され、今回のプールには載っていない
        pool.keys.extend(extra[..2].iter().cloned());
        pool.current_index = 2;

        let setup = ensure_keys_setup(&mut pool, &ledger, None, &account_id, 1)
            .await
            .unwrap();
        assert!(setup.keys_to_add.is_empty());
        assert_eq!(
            setup.keys_removed,
            vec![extra[1].public_key(), extra[0].public_key(), extra[2].public_key()]
        );
        assert_eq!(pool.keys.len(), 1);
        assert_eq!(pool.current_index, 0);
        assert_eq!(ledger.keys_of(&account_id), vec![pool.keys[0].public_key(), operator]);
    }

    /// 運用者が追加した鍵は同期で削除されないことを確認
    #[tokio::test]
    async fn test_ensure_keys_setup_keeps_operator_keys() {
        let ledger = MockLedger::new(Network::Testnet);
        let tee = MockTee::new();
        let (mut pool, account_id) = funded_pool(&ledger, Some(&tee)).await;
        let recovery = AgentKey::from_seed(&[0x78; 32]).public_key();
        ledger.add_account(&account_id, 1, vec![pool.keys[0].public_key(), recovery]);

        let setup = ensure_keys_setup(&mut pool, &ledger, Some(&tee), &account_id, 2)
            .await
            .unwrap();
        assert_eq!(setup.keys_to_add, vec![pool.keys[1].public_key()]);
        assert!(setup.keys_removed.is_empty());

        let mut expected = vec![pool.keys[0].public_key(), recovery, pool.keys[1].public_key()];
        expected.sort();
        let mut actual = ledger.keys_of(&account_id);
        actual.sort();
        assert_eq!(actual, expected);
        assert!(ledger
            .sent()
            .iter()
            .all(|tx| tx.actions.iter().all(|a| !matches!(a, Action::DeleteKey { .. }))));
    }

    /// ランダム鍵のプールでは照合できないので、プール外の鍵は残すことを確認
    #[tokio::test]
    async fn test_ensure_keys_setup_random_pool_keeps_unknown_keys() {
        let ledger = MockLedger::new(Network::Testnet);
        let identity = generate_identity(None, None).await.unwrap();
        let account_id = identity.account_id.clone();
        let other = AgentKey::generate().public_key();
        ledger.add_account(&account_id, 1, vec![identity.key.public_key(), other]);
        let mut pool = KeyPool::new(identity);

        let setup = ensure_keys_setup(&mut pool, &ledger, None, &account_id, 1)
            .await
            .unwrap();
        assert!(setup.keys_removed.is_empty());
        assert!(ledger.sent().is_empty());
        assert_eq!(ledger.keys_of(&account_id).len(), 2);
    }

    /// 来歴エラーはレジャー操作より前に発生することを確認
    #[tokio::test]
    async fn test_provenance_error_before_ledger_calls() {
        let ledger = MockLedger::new(Network::Testnet);
        let tee = MockTee::new();
        let (mut pool, account_id) = funded_pool(&ledger, Some(&tee)).await;

        let err = ensure_keys_setup(&mut pool, &ledger, None, &account_id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::KeyProvenance(_)));
        assert_eq!(ledger.access_key_queries(), 0);
        assert!(ledger.sent().is_empty());
        assert!(!pool.checked);
        assert_eq!(pool.keys.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_keys_setup_unfunded_account_is_retried_later() {
        let ledger = MockLedger::new(Network::Testnet);
        let identity = generate_identity(None, Some("agent")).await.unwrap();
        let account_id = identity.account_id.clone();
        let mut pool = KeyPool::new(identity);

        let err = ensure_keys_setup(&mut pool, &ledger, None, &account_id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Ledger(_)));
        assert!(!pool.checked);
    }

    #[test]
    fn test_select_signer() {
        assert!(matches!(select_signer(&[], 0), Err(AgentError::NoKeysAvailable)));

        let single = vec![AgentKey::from_seed(&[1; 32])];
        let s = select_signer(&single, 5).unwrap();
        assert_eq!(s.next_index, 0);
        assert_eq!(s.key, &single[0]);

        let keys: Vec<AgentKey> = (1u8..=3).map(|i| AgentKey::from_seed(&[i; 32])).collect();
        let mut current = 0;
        let mut order = Vec::new();
        for _ in 0..4 {
            let s = select_signer(&keys, current).unwrap();
            order.push(s.next_index);
            current = s.next_index;
        }
        assert_eq!(order, vec![1, 2, 0, 1]);
    }
}
