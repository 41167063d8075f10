use crate::geoip::record::{
    BlockRecord, CountryLocationRecord, GeonameId, Ipv4BlockRecord, Ipv6BlockRecord,
};

use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::net::IpAddr;

/// Country code → geoname id → networks index.
///
/// Built once from parsed records and never mutated afterwards; refreshing
/// means building a new one and publishing it, see [crate::geoip::GeoIp].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeoIndex {
    country_code_to_geo: HashMap<String, GeonameId>,
    geo_to_ipv4_networks: HashMap<GeonameId, Vec<Ipv4Net>>,
    geo_to_ipv6_networks: HashMap<GeonameId, Vec<Ipv6Net>>,
}

impl GeoIndex {
    pub fn build<I4, I6, IC>(ipv4: I4, ipv6: I6, countries: IC) -> Self
    where
        I4: IntoIterator<Item = Ipv4BlockRecord>,
        I6: IntoIterator<Item = Ipv6BlockRecord>,
        IC: IntoIterator<Item = CountryLocationRecord>,
    {
        let mut country_code_to_geo = HashMap::new();
        for country in countries {
            if country.country_iso_code.is_empty() {
                continue;
            }
            // Last record wins
            country_code_to_geo.insert(country.country_iso_code, country.geoname_id);
        }

        let index = Self {
            country_code_to_geo,
            geo_to_ipv4_networks: Self::group_networks(ipv4),
            geo_to_ipv6_networks: Self::group_networks(ipv6),
        };
        log::info!(
            "geo index built: {} countries, {} IPv4 and {} IPv6 networks",
            index.country_code_to_geo.len(),
            index.geo_to_ipv4_networks.values().map(Vec::len).sum::<usize>(),
            index.geo_to_ipv6_networks.values().map(Vec::len).sum::<usize>(),
        );
        index
    }

    fn group_networks<N, I>(records: I) -> HashMap<GeonameId, Vec<N>>
    where
        I: IntoIterator<Item = BlockRecord<N>>,
    {
        let mut map: HashMap<GeonameId, Vec<N>> = HashMap::new();
        for record in records {
            let (network, geoname_id) = match (record.network, record.geoname_id) {
                (Some(network), Some(geoname_id)) => (network, geoname_id),
                _ => continue,
            };
            map.entry(geoname_id).or_default().push(network);
        }
        map
    }

    pub fn geoname_id(&self, country_code: &str) -> Option<GeonameId> {
        self.country_code_to_geo.get(country_code).copied()
    }

    pub fn ipv4_networks(&self, geoname_id: GeonameId) -> &[Ipv4Net] {
        self.geo_to_ipv4_networks
            .get(&geoname_id)
            .map_or(&[][..], Vec::as_slice)
    }

    pub fn ipv6_networks(&self, geoname_id: GeonameId) -> &[Ipv6Net] {
        self.geo_to_ipv6_networks
            .get(&geoname_id)
            .map_or(&[][..], Vec::as_slice)
    }

    pub fn countries_len(&self) -> usize {
        self.country_code_to_geo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geo_to_ipv4_networks.is_empty() && self.geo_to_ipv6_networks.is_empty()
    }

    /// Whether `address` is inside a network of any of `country_codes`.
    ///
    /// Codes are tried in the given order and the search stops at the first
    /// containing network. Unknown codes never match. IPv4 addresses,
    /// IPv4-mapped ones included, are checked against IPv4 networks only,
    /// other IPv6 addresses against IPv6 networks only.
    pub fn is_whitelisted<S>(&self, address: IpAddr, country_codes: &[S]) -> bool
    where
        S: AsRef<str>,
    {
        let address = to_canonical_ip(address);
        country_codes
            .iter()
            .filter_map(|code| self.geoname_id(code.as_ref()))
            .any(|geoname_id| match address {
                IpAddr::V4(ip) => self
                    .ipv4_networks(geoname_id)
                    .iter()
                    .any(|network| network.contains(&ip)),
                IpAddr::V6(ip) => self
                    .ipv6_networks(geoname_id)
                    .iter()
                    .any(|network| network.contains(&ip)),
            })
    }
}

/// `::ffff:a.b.c.d` becomes `a.b.c.d`, the deprecated IPv4-compatible form
/// `::a.b.c.d` stays IPv6
fn to_canonical_ip(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(address, IpAddr::V4),
        IpAddr::V4(_) => address,
    }
}
