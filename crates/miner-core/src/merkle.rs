//! Merkle tree computation for Bitcoin transactions.
//!
//! All hashes here are in internal byte order. Display order (reversed hex)
//! only appears at the RPC boundary.

use crate::hash::hash_pair;

/// Compute the merkle root from a list of transaction IDs.
///
/// For a single transaction (like a coinbase-only block), the merkle root
/// is simply the txid itself. An empty list has no meaningful root and yields
/// all zeros; a block always carries at least its coinbase.
pub fn compute_merkle_root(txids: &[[u8; 32]]) -> [u8; 32] {
    match txids {
        [] => [0u8; 32],
        [only] => *only,
        _ => {
            let mut current_level: Vec<[u8; 32]> = txids.to_vec();

            while current_level.len() > 1 {
                current_level = next_level(&current_level);
            }

            current_level[0]
        }
    }
}

/// Hash one tree level into the next, duplicating the last node of an odd level.
fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_pair(left, right),
            [last] => hash_pair(last, last),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

/// Sibling path proving one leaf's position in a merkle tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBranch {
    /// Index of the proven leaf.
    pub index: usize,
    /// Sibling hashes from the leaf level up to just below the root.
    pub siblings: Vec<[u8; 32]>,
}

impl MerkleBranch {
    /// Fold `leaf` up the branch to obtain the root it commits to.
    pub fn root(&self, leaf: &[u8; 32]) -> [u8; 32] {
        let mut current = *leaf;
        let mut index = self.index;

        for sibling in &self.siblings {
            current = if index & 1 == 0 {
                hash_pair(&current, sibling)
            } else {
                hash_pair(sibling, &current)
            };
            index >>= 1;
        }

        current
    }

    /// Number of levels in the branch.
    pub fn len(&self) -> usize {
        self.siblings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }
}

/// Build the branch for the leaf at `index`.
///
/// Returns `None` if `index` is out of range.
pub fn merkle_branch(txids: &[[u8; 32]], index: usize) -> Option<MerkleBranch> {
    if index >= txids.len() {
        return None;
    }

    let mut siblings = Vec::new();
    let mut current_level: Vec<[u8; 32]> = txids.to_vec();
    let mut current_index = index;

    while current_level.len() > 1 {
        let sibling = current_index ^ 1;
        // An odd level's last node pairs with itself
        siblings.push(*current_level.get(sibling).unwrap_or(&current_level[current_index]));

        current_level = next_level(&current_level);
        current_index /= 2;
    }

    Some(MerkleBranch { index, siblings })
}

/// Branch for the coinbase (leaf 0) given only the non-coinbase transaction IDs.
///
/// Leaf 0 never contributes to its own siblings, so the branch can be
/// computed before the coinbase exists and reused for every extranonce.
pub fn coinbase_branch(txids: &[[u8; 32]]) -> MerkleBranch {
    let mut leaves = Vec::with_capacity(txids.len() + 1);
    leaves.push([0u8; 32]);
    leaves.extend_from_slice(txids);

    merkle_branch(&leaves, 0).unwrap_or(MerkleBranch {
        index: 0,
        siblings: Vec::new(),
    })
}

/// Generate the scriptPubKey for a witness commitment output.
///
/// Format: OP_RETURN <commitment>
/// Where commitment = 0xaa21a9ed || witness_commitment
pub fn witness_commitment_script(witness_commitment: &[u8; 32]) -> Vec<u8> {
    let mut script = Vec::with_capacity(38);

    // OP_RETURN
    script.push(0x6a);

    // Push 36 bytes
    script.push(0x24);

    script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
    script.extend_from_slice(witness_commitment);

    script
}

/// Magic bytes preceding the witness commitment hash.
pub const WITNESS_COMMITMENT_HEADER: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];
