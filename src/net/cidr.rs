//! Pure IPv4 CIDR arithmetic for subnet sizing and enumeration.
//!
//! All operations are deterministic and work on [`ipnet::Ipv4Net`] values;
//! string parsing happens once at the edges via [`parse_cidr`].

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Parse an IPv4 CIDR string, normalising it to its network address.
///
/// `"10.0.1.7/24"` parses to `10.0.1.0/24`. IPv6 input is rejected.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|e| Error::invalid_cidr(cidr, e))?;
    Ok(net.trunc())
}

/// Calculate the largest prefix length (smallest subnet) whose usable host
/// capacity `2^(32-p) - 2` still satisfies `required_hosts`.
///
/// The two reserved addresses are the network and broadcast addresses.
/// The result is clamped to `1..=32`. A required host count of zero yields
/// a `/30`, matching what the kubelet-facing behaviour has always been for
/// nodes advertising no pod capacity.
pub fn smallest_mask_for_hosts(required_hosts: u32) -> u8 {
    if required_hosts == 0 {
        return 30;
    }

    // ceil(log2(n + 2)) via the next power of two
    let needed = u64::from(required_hosts) + 2;
    let bits = needed.next_power_of_two().trailing_zeros() as i32;

    (32 - bits).clamp(1, 32) as u8
}

/// Total number of addresses (including the two reserved ones) in a subnet
/// with `mask` network bits.
pub fn hosts_for_mask(mask: u8) -> Result<u32> {
    if !(1..=32).contains(&mask) {
        return Err(Error::InvalidMask(mask));
    }

    Ok(1u32 << (32 - mask))
}

/// Number of assignable addresses in a subnet with `mask` network bits,
/// i.e. the total minus the network and broadcast addresses.
pub fn usable_hosts_for_mask(mask: u8) -> Result<u32> {
    Ok(hosts_for_mask(mask)?.saturating_sub(2))
}

/// Enumerate every `/mask` subnet tiling `pool`, ascending by network
/// address.
///
/// An empty list means the pool is too small to hold even one subnet of
/// the requested size; that is not an error, it just tells the caller to
/// move on to the next pool.
pub fn subnets_from_pool(pool: &str, mask: u8) -> Result<Vec<Ipv4Net>> {
    if !(1..=32).contains(&mask) {
        return Err(Error::InvalidMask(mask));
    }

    let pool_net = parse_cidr(pool)?;
    if mask < pool_net.prefix_len() {
        return Ok(Vec::new());
    }

    let subnets = pool_net
        .subnets(mask)
        .map_err(|_| Error::InvalidMask(mask))?;
    Ok(subnets.collect())
}

/// Whether two parsed networks overlap: either they are equal, or one
/// contains the other's network address. Symmetric by construction.
pub fn nets_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a == b || a.contains(&b.network()) || b.contains(&a.network())
}

/// String-level overlap test; fails with `InvalidCidr` on either malformed
/// input.
pub fn networks_overlap(a: &str, b: &str) -> Result<bool> {
    let a_net = parse_cidr(a)?;
    let b_net = parse_cidr(b)?;

    Ok(nets_overlap(&a_net, &b_net))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_mask_standard_sizes() {
        // 254 + 2 reserved = 256 = 2^8 => /24
        assert_eq!(smallest_mask_for_hosts(254), 24);
        // 30 + 2 = 32 = 2^5 => /27
        assert_eq!(smallest_mask_for_hosts(30), 27);
        assert_eq!(smallest_mask_for_hosts(10), 28);
        assert_eq!(smallest_mask_for_hosts(62), 26);
        // 63 + 2 = 65 does not fit a /26
        assert_eq!(smallest_mask_for_hosts(63), 25);
        assert_eq!(smallest_mask_for_hosts(1), 30);
        assert_eq!(smallest_mask_for_hosts(2), 30);
    }

    #[test]
    fn smallest_mask_zero_hosts_yields_slash_30() {
        assert_eq!(smallest_mask_for_hosts(0), 30);
    }

    #[test]
    fn smallest_mask_clamps_to_valid_range() {
        assert_eq!(smallest_mask_for_hosts(u32::MAX), 1);
    }

    #[test]
    fn smallest_mask_is_minimal() {
        // For every n, the returned prefix must satisfy the host count and
        // the next-larger prefix must not.
        for n in 1u32..=2048 {
            let p = smallest_mask_for_hosts(n);
            assert!(
                usable_hosts_for_mask(p).unwrap() >= n,
                "/{p} cannot hold {n} hosts"
            );
            if p < 31 {
                assert!(
                    usable_hosts_for_mask(p + 1).unwrap() < n,
                    "/{} would already hold {n} hosts",
                    p + 1
                );
            }
        }
    }

    #[test]
    fn hosts_for_mask_counts_all_addresses() {
        assert_eq!(hosts_for_mask(26).unwrap(), 64);
        assert_eq!(hosts_for_mask(24).unwrap(), 256);
        assert_eq!(hosts_for_mask(32).unwrap(), 1);
        assert_eq!(hosts_for_mask(1).unwrap(), 1 << 31);
        assert!(hosts_for_mask(0).is_err());
        assert!(hosts_for_mask(33).is_err());
    }

    #[test]
    fn usable_hosts_subtracts_reserved() {
        assert_eq!(usable_hosts_for_mask(26).unwrap(), 62);
        // /31 and /32 have no usable hosts rather than underflowing
        assert_eq!(usable_hosts_for_mask(31).unwrap(), 0);
        assert_eq!(usable_hosts_for_mask(32).unwrap(), 0);
        assert!(usable_hosts_for_mask(33).is_err());
    }

    #[test]
    fn subnets_from_pool_tiles_in_order() {
        let got = subnets_from_pool("10.0.0.0/24", 26).unwrap();
        let want = ["10.0.0.0/26", "10.0.0.64/26", "10.0.0.128/26", "10.0.0.192/26"];
        assert_eq!(
            got.iter().map(ToString::to_string).collect::<Vec<_>>(),
            want
        );

        let got = subnets_from_pool("10.0.0.0/27", 28).unwrap();
        assert_eq!(
            got.iter().map(ToString::to_string).collect::<Vec<_>>(),
            ["10.0.0.0/28", "10.0.0.16/28"]
        );
    }

    #[test]
    fn subnets_from_pool_too_small_is_empty() {
        // A /24 cannot hold a /23; empty result, not an error, so the
        // caller can continue with the next pool.
        assert!(subnets_from_pool("10.0.0.0/24", 23).unwrap().is_empty());
    }

    #[test]
    fn subnets_from_pool_rejects_bad_input() {
        assert!(subnets_from_pool("10.0.0/24", 26).is_err());
        assert!(subnets_from_pool("10.0.0.0/39", 26).is_err());
        assert!(subnets_from_pool("fd00::/64", 80).is_err());
        assert!(matches!(
            subnets_from_pool("10.0.0.0/24", 33),
            Err(Error::InvalidMask(33))
        ));
    }

    #[test]
    fn subnets_are_contained_disjoint_and_sized() {
        for mask in 24..=30u8 {
            let pool = parse_cidr("192.168.4.0/24").unwrap();
            let subnets = subnets_from_pool("192.168.4.0/24", mask).unwrap();
            assert_eq!(subnets.len(), 1 << (mask - 24));

            for (i, a) in subnets.iter().enumerate() {
                assert_eq!(a.prefix_len(), mask);
                assert!(pool.contains(&a.network()));
                for b in &subnets[i + 1..] {
                    assert!(!nets_overlap(a, b), "{a} overlaps {b}");
                }
            }
        }
    }

    #[test]
    fn overlap_is_reflexive_and_symmetric() {
        let cases = [
            ("10.0.0.0/24", "10.0.0.128/25", true),
            ("10.0.0.0/24", "10.0.1.0/24", false),
            ("10.0.0.0/16", "10.0.200.0/24", true),
            ("10.0.0.0/26", "10.0.0.0/26", true),
            ("172.16.0.0/12", "192.168.0.0/16", false),
        ];
        for (a, b, want) in cases {
            assert_eq!(networks_overlap(a, b).unwrap(), want, "{a} vs {b}");
            assert_eq!(networks_overlap(b, a).unwrap(), want, "{b} vs {a}");
            assert!(networks_overlap(a, a).unwrap());
        }
    }

    #[test]
    fn overlap_rejects_malformed_input() {
        assert!(networks_overlap("10.0.0/20", "10.0.0.0/24").is_err());
        assert!(networks_overlap("10.0.0.0/24", "not-a-cidr").is_err());
    }

    #[test]
    fn parse_cidr_truncates_host_bits() {
        assert_eq!(parse_cidr("10.0.1.7/24").unwrap().to_string(), "10.0.1.0/24");
    }
}
