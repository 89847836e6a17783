/// Names for the common scalar type OIDs from pg_type. An OID missing here
/// is not an error; its values render as hex.
pub fn type_name(oid: i32) -> Option<&'static str> {
    let name = match oid {
        16 => "bool",
        17 => "bytea",
        18 => "char",
        19 => "name",
        20 => "int8",
        21 => "int2",
        22 => "int2vector",
        23 => "int4",
        24 => "regproc",
        25 => "text",
        26 => "oid",
        27 => "tid",
        28 => "xid",
        29 => "cid",
        114 => "json",
        142 => "xml",
        600 => "point",
        650 => "cidr",
        700 => "float4",
        701 => "float8",
        705 => "unknown",
        790 => "money",
        829 => "macaddr",
        869 => "inet",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1083 => "time",
        1114 => "timestamp",
        1184 => "timestamptz",
        1700 => "numeric",
        2950 => "uuid",
        _ => return None,
    };
    Some(name)
}

/// Render a raw parameter value as a human-readable string for audit output.
/// This never fails: a wrong byte count or an unmapped OID falls back to the
/// lowercase hex encoding of the raw bytes.
pub fn stringify(oid: i32, bytes: &[u8]) -> String {
    match type_name(oid) {
        Some("bool") => match bytes.first() {
            Some(&b) => (b == 0x01).to_string(),
            None => hex::encode(bytes),
        },
        Some("char") => match bytes.first() {
            Some(&b) => (b as char).to_string(),
            None => hex::encode(bytes),
        },
        Some("int2") => match <[u8; 2]>::try_from(bytes) {
            Ok(raw) => i16::from_be_bytes(raw).to_string(),
            Err(_) => hex::encode(bytes),
        },
        Some("int4") | Some("oid") => match <[u8; 4]>::try_from(bytes) {
            Ok(raw) => i32::from_be_bytes(raw).to_string(),
            Err(_) => hex::encode(bytes),
        },
        Some("int8") => match <[u8; 8]>::try_from(bytes) {
            Ok(raw) => i64::from_be_bytes(raw).to_string(),
            Err(_) => hex::encode(bytes),
        },
        Some("text") | Some("varchar") | Some("bpchar") => {
            String::from_utf8_lossy(bytes).to_string()
        }
        _ => hex::encode(bytes),
    }
}
