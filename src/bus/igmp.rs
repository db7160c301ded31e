//! IGMP v2/v3 message parsing
//!
//! Only the subset the bus needs: Membership Reports feed group
//! learning, Membership Queries feed the last-member timeout. Queries
//! and reports are parsed leniently; a malformed tail stops processing
//! but keeps whatever was already extracted.

pub const IGMP_TYPE_MEMBERSHIP_QUERY: u8 = 0x11;
pub const IGMP_TYPE_V2_MEMBERSHIP_REPORT: u8 = 0x16;
pub const IGMP_TYPE_V3_MEMBERSHIP_REPORT: u8 = 0x22;

pub const IGMP_RECORD_MODE_IS_INCLUDE: u8 = 1;
pub const IGMP_RECORD_MODE_IS_EXCLUDE: u8 = 2;
pub const IGMP_RECORD_CHANGE_TO_INCLUDE_MODE: u8 = 3;
pub const IGMP_RECORD_CHANGE_TO_EXCLUDE_MODE: u8 = 4;

/// type + max-resp-code + checksum
const BASE_LEN: usize = 4;
/// group address
const V2_EXTRA_LEN: usize = 4;
/// group + s/qrv + qqic + number-of-sources
const V3_QUERY_EXTRA_LEN: usize = 8;
/// reserved + number-of-group-records
const V3_REPORT_EXTRA_LEN: usize = 4;
/// record type + aux-data-len + number-of-sources + group
const V3_RECORD_HEADER_LEN: usize = 8;
const SOURCE_LEN: usize = 4;

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn read_group(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Extract the group of a Group-Specific Query, if `igmp` is one.
///
/// A v2 query is recognised by an exact v2 length and a nonzero
/// max-response code; a v3 query must name a group and carry no
/// sources. General queries (group 0) return `None`.
pub fn query_group(igmp: &[u8]) -> Option<u32> {
    if igmp.len() < BASE_LEN || igmp[0] != IGMP_TYPE_MEMBERSHIP_QUERY {
        return None;
    }
    let max_resp_code = igmp[1];
    let rest = &igmp[BASE_LEN..];

    if rest.len() == V2_EXTRA_LEN && max_resp_code != 0 {
        let group = read_group(rest, 0);
        return if group != 0 { Some(group) } else { None };
    }

    if rest.len() >= V3_QUERY_EXTRA_LEN {
        let group = read_group(rest, 0);
        let num_sources = read_u16(rest, 6) as usize;
        if rest.len() < V3_QUERY_EXTRA_LEN + num_sources * SOURCE_LEN {
            return None;
        }
        if group != 0 && num_sources == 0 {
            return Some(group);
        }
    }

    None
}

/// Extract the groups a Membership Report joins or refreshes.
///
/// v2 reports name a single group. v3 reports carry records; EXCLUDE
/// records always count as membership, INCLUDE records only when they
/// list sources (an empty INCLUDE is a leave). Groups parsed before a
/// truncation are returned.
pub fn report_groups(igmp: &[u8]) -> Vec<u32> {
    let mut groups = Vec::new();

    if igmp.len() < BASE_LEN {
        return groups;
    }

    match igmp[0] {
        IGMP_TYPE_V2_MEMBERSHIP_REPORT => {
            let rest = &igmp[BASE_LEN..];
            if rest.len() >= V2_EXTRA_LEN {
                groups.push(read_group(rest, 0));
            }
        }
        IGMP_TYPE_V3_MEMBERSHIP_REPORT => {
            let rest = &igmp[BASE_LEN..];
            if rest.len() < V3_REPORT_EXTRA_LEN {
                return groups;
            }
            let num_records = read_u16(rest, 2) as usize;
            let mut pos = V3_REPORT_EXTRA_LEN;

            for _ in 0..num_records {
                if rest.len() < pos + V3_RECORD_HEADER_LEN {
                    return groups;
                }
                let record_type = rest[pos];
                // aux data length is in 32-bit words
                let aux_len = rest[pos + 1] as usize * 4;
                let num_sources = read_u16(rest, pos + 2) as usize;
                let group = read_group(rest, pos + 4);
                pos += V3_RECORD_HEADER_LEN;

                if rest.len() < pos + num_sources * SOURCE_LEN {
                    return groups;
                }
                pos += num_sources * SOURCE_LEN;

                if rest.len() < pos + aux_len {
                    return groups;
                }
                pos += aux_len;

                match record_type {
                    IGMP_RECORD_MODE_IS_INCLUDE | IGMP_RECORD_CHANGE_TO_INCLUDE_MODE => {
                        if num_sources != 0 {
                            groups.push(group);
                        }
                    }
                    IGMP_RECORD_MODE_IS_EXCLUDE | IGMP_RECORD_CHANGE_TO_EXCLUDE_MODE => {
                        groups.push(group);
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn v2_report(group: u32) -> Vec<u8> {
        let mut msg = vec![IGMP_TYPE_V2_MEMBERSHIP_REPORT, 0, 0, 0];
        msg.extend_from_slice(&group.to_be_bytes());
        msg
    }

    fn v3_report(records: &[(u8, u16, u32)]) -> Vec<u8> {
        let mut msg = vec![IGMP_TYPE_V3_MEMBERSHIP_REPORT, 0, 0, 0, 0, 0];
        msg.extend_from_slice(&(records.len() as u16).to_be_bytes());
        for &(record_type, num_sources, group) in records {
            msg.push(record_type);
            msg.push(0);
            msg.extend_from_slice(&num_sources.to_be_bytes());
            msg.extend_from_slice(&group.to_be_bytes());
            for _ in 0..num_sources {
                msg.extend_from_slice(&[0u8; 4]);
            }
        }
        msg
    }

    #[test]
    fn v2_report_single_group() {
        assert_eq!(report_groups(&v2_report(0xe001_0203)), vec![0xe001_0203]);
    }

    #[test]
    fn v3_record_modes() {
        let msg = v3_report(&[
            (IGMP_RECORD_MODE_IS_EXCLUDE, 0, 1),
            (IGMP_RECORD_MODE_IS_INCLUDE, 0, 2),
            (IGMP_RECORD_MODE_IS_INCLUDE, 2, 3),
            (IGMP_RECORD_CHANGE_TO_EXCLUDE_MODE, 0, 4),
            (IGMP_RECORD_CHANGE_TO_INCLUDE_MODE, 1, 5),
        ]);
        assert_eq!(report_groups(&msg), vec![1, 3, 4, 5]);
    }

    #[test]
    fn v3_truncated_record_keeps_earlier_groups() {
        let mut msg = v3_report(&[(IGMP_RECORD_MODE_IS_EXCLUDE, 0, 7)]);
        // claim a second record that is not there
        msg[7] = 2;
        assert_eq!(report_groups(&msg), vec![7]);
    }

    #[test]
    fn v2_group_specific_query() {
        let mut msg = vec![IGMP_TYPE_MEMBERSHIP_QUERY, 100, 0, 0];
        msg.extend_from_slice(&0xe001_0203u32.to_be_bytes());
        assert_eq!(query_group(&msg), Some(0xe001_0203));

        // general query: group zero
        let mut general = vec![IGMP_TYPE_MEMBERSHIP_QUERY, 100, 0, 0];
        general.extend_from_slice(&[0u8; 4]);
        assert_eq!(query_group(&general), None);

        // v1-style query: zero max response code
        msg[1] = 0;
        assert_eq!(query_group(&msg), None);
    }

    #[test]
    fn v3_group_specific_query() {
        let mut msg = vec![IGMP_TYPE_MEMBERSHIP_QUERY, 100, 0, 0];
        msg.extend_from_slice(&0xe001_0203u32.to_be_bytes());
        msg.extend_from_slice(&[0, 0]); // s/qrv, qqic
        msg.extend_from_slice(&0u16.to_be_bytes());
        assert_eq!(query_group(&msg), Some(0xe001_0203));

        // sources present: not group-specific in the timer-lowering sense
        let len = msg.len();
        msg[len - 1] = 1;
        msg.extend_from_slice(&[0u8; 4]);
        assert_eq!(query_group(&msg), None);
    }
}
