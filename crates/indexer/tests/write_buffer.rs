use utxod_indexer::slot_cache::{
    Lookup, ADDRESS_BUCKET_WEIGHT, ADDRESS_REF_WEIGHT, RAW_TX_BASE_WEIGHT, SEQUENCE_WEIGHT,
    UTXO_ADD_WEIGHT, UTXO_DELETE_WEIGHT,
};
use utxod_indexer::{SlotCache, SlotEntries, UtxoDetail, UtxoSource};

fn source(tag: u8) -> UtxoSource {
    UtxoSource::new([tag; 32], u32::from(tag))
}

fn detail(height: u32) -> UtxoDetail {
    UtxoDetail {
        amount: 1_000,
        height,
        address: "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef".to_string(),
        script: vec![0x76, 0xa9],
    }
}

#[test]
fn add_then_remove_cancels_to_nothing() {
    let mut entries = SlotEntries::new();
    entries.add_utxo(source(1), detail(10));
    entries.remove_utxo(source(1));
    assert!(entries.utxo_adds().is_empty());
    assert!(entries.utxo_deletes().is_empty());
    assert_eq!(entries.lookup_utxo(&source(1)), Lookup::Unknown);
    assert!(entries.is_empty());
    assert_eq!(entries.weight(), 0);
}

#[test]
fn remove_of_persisted_key_records_tombstone() {
    let mut entries = SlotEntries::new();
    entries.remove_utxo(source(2));
    assert!(entries.utxo_deletes().contains(&source(2)));
    assert_eq!(entries.lookup_utxo(&source(2)), Lookup::Spent);
    assert_eq!(entries.weight(), UTXO_DELETE_WEIGHT);
}

#[test]
fn weight_follows_entry_costs() {
    let mut entries = SlotEntries::new();
    entries.add_address_association("a", 1);
    entries.add_address_association("a", 2);
    entries.add_address_association("b", 2);
    entries.add_utxo(source(1), detail(1));
    entries.add_utxo(source(2), detail(1));
    entries.remove_utxo(source(3));
    entries.add_sequence_mapping(1, [1; 32]);
    entries.add_raw_transaction([1; 32], vec![0u8; 60]);

    let expected = 2 * ADDRESS_BUCKET_WEIGHT
        + 3 * ADDRESS_REF_WEIGHT
        + 2 * UTXO_ADD_WEIGHT
        + UTXO_DELETE_WEIGHT
        + SEQUENCE_WEIGHT
        + RAW_TX_BASE_WEIGHT
        + 60;
    assert_eq!(entries.weight(), expected);
    assert_eq!(expected, 60 + 24 + 216 + 36 + 36 + 92);
}

#[test]
fn absorb_applies_cancel_rule_across_layers() {
    let mut base = SlotEntries::new();
    base.add_utxo(source(1), detail(1));
    base.add_address_association("a", 1);

    let mut delta = SlotEntries::new();
    delta.remove_utxo(source(1));
    delta.remove_utxo(source(9));
    delta.add_utxo(source(2), detail(2));
    delta.add_address_association("a", 1);
    delta.add_address_association("a", 2);
    delta.add_sequence_mapping(2, [2; 32]);

    base.absorb(delta);
    assert_eq!(base.lookup_utxo(&source(1)), Lookup::Unknown);
    assert_eq!(base.lookup_utxo(&source(9)), Lookup::Spent);
    assert_eq!(base.lookup_utxo(&source(2)), Lookup::Found(&detail(2)));
    assert_eq!(base.address_refs()["a"].len(), 2);
    assert_eq!(base.sequences().len(), 1);
    for key in base.utxo_adds().keys() {
        assert!(!base.utxo_deletes().contains(key));
    }
}

#[test]
fn shared_cache_reports_weight_and_clears() {
    let cache = SlotCache::new();
    {
        let mut entries = cache.lock();
        entries.add_utxo(source(1), detail(1));
    }
    assert_eq!(cache.weight(), UTXO_ADD_WEIGHT);
    cache.lock().clear();
    assert!(cache.is_empty());
}
