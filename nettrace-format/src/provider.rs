use sha1::{Digest, Sha1};

use crate::types::Guid;

/// Providers that registered GUIDs before the name-hash convention existed.
const LEGACY_PROVIDERS: &[(&str, Guid)] = &[
    (
        "System.Threading.Tasks.TplEventSource",
        Guid::from_fields(
            0x2e5dba47,
            0xa3d2,
            0x4d16,
            [0x8e, 0xe0, 0x66, 0x71, 0xff, 0xdc, 0xd7, 0xb5],
        ),
    ),
    (
        "Microsoft-Windows-DotNETRuntime",
        Guid::from_fields(
            0xe13c0d23,
            0xccbc,
            0x4e12,
            [0x93, 0x1b, 0xd9, 0xcc, 0x2e, 0xee, 0x27, 0xe4],
        ),
    ),
    (
        "Microsoft-Windows-DotNETRuntimePrivate",
        Guid::from_fields(
            0x763fd754,
            0x7086,
            0x4dfe,
            [0x95, 0xeb, 0xc0, 0x1a, 0x46, 0xfa, 0xf4, 0xca],
        ),
    ),
    (
        "Microsoft-Windows-DotNETRuntimeRundown",
        Guid::from_fields(
            0xa669021c,
            0xc450,
            0x4609,
            [0xa0, 0x35, 0x5a, 0xf5, 0x9a, 0xf4, 0xdf, 0x18],
        ),
    ),
    (
        "Microsoft-Windows-DotNETRuntimeStress",
        Guid::from_fields(
            0xcc2bcbba,
            0x16b6,
            0x4cf3,
            [0x89, 0x90, 0xd7, 0x4c, 0x2e, 0x8a, 0xf5, 0x00],
        ),
    ),
    (
        "System.Diagnostics.Eventing.FrameworkEventSource",
        Guid::from_fields(
            0x8e9f5090,
            0x2d75,
            0x4d03,
            [0x8a, 0x81, 0xe5, 0xaf, 0xbf, 0x85, 0xda, 0xf1],
        ),
    ),
    (
        "Microsoft-DotNETCore-SampleProfiler",
        Guid::from_fields(
            0x3c530d44,
            0x97ae,
            0x513a,
            [0x1e, 0x6d, 0x78, 0x3e, 0x8f, 0x8e, 0x03, 0xa9],
        ),
    ),
];

/// Namespace prepended to the hashed name, per the EventSource convention.
const EVENTSOURCE_NAMESPACE: [u8; 16] = [
    0x48, 0x2c, 0x2d, 0xb2, 0xc3, 0x90, 0x47, 0xc8, 0x87, 0xf8, 0x1a, 0x15, 0xbf, 0xc1, 0x30, 0xfb,
];

/// Derive the provider GUID for a provider name.
///
/// Legacy registrations return their fixed constants; any other non-empty
/// name is hashed with the EventSource name-to-GUID convention: SHA-1 over
/// the namespace followed by the upper-cased name in UTF-16BE, truncated to
/// 16 bytes, version nibble forced to 5. The convention predates RFC 4122
/// conformance and leaves the variant bits untouched; keep it that way or
/// derived GUIDs stop matching what emitters report.
pub fn provider_guid_from_name(name: &str) -> Guid {
    if name.is_empty() {
        return Guid::ZERO;
    }
    if let Some((_, guid)) = LEGACY_PROVIDERS.iter().find(|(n, _)| *n == name) {
        return *guid;
    }

    let mut hasher = Sha1::new();
    hasher.update(EVENTSOURCE_NAMESPACE);
    for unit in name.to_uppercase().encode_utf16() {
        hasher.update(unit.to_be_bytes());
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[7] = (bytes[7] & 0x0f) | 0x50;
    Guid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_name_is_zero_guid() {
        assert_eq!(provider_guid_from_name(""), Guid::ZERO);
    }

    #[test]
    fn clr_provider_uses_fixed_guid() {
        assert_eq!(
            provider_guid_from_name("Microsoft-Windows-DotNETRuntime").to_string(),
            "e13c0d23-ccbc-4e12-931b-d9cc2eee27e4"
        );
    }

    #[test]
    fn sample_profiler_uses_fixed_guid() {
        assert_eq!(
            provider_guid_from_name("Microsoft-DotNETCore-SampleProfiler").to_string(),
            "3c530d44-97ae-513a-1e6d-783e8f8e03a9"
        );
    }

    // Expected bytes computed independently with the reference algorithm
    // (SHA-1 of namespace + upper-cased UTF-16BE name, version nibble 5).
    #[rstest]
    #[case(
        "Sample",
        [147, 241, 229, 115, 140, 212, 215, 92, 110, 237, 132, 251, 206, 116, 0, 15]
    )]
    #[case(
        "Some-Custom-Source",
        [148, 228, 119, 111, 103, 249, 60, 83, 203, 189, 155, 67, 4, 130, 249, 240]
    )]
    fn custom_names_hash_with_eventsource_convention(
        #[case] name: &str,
        #[case] expected: [u8; 16],
    ) {
        assert_eq!(provider_guid_from_name(name), Guid::from_bytes(expected));
    }

    #[test]
    fn hash_is_case_insensitive() {
        assert_eq!(
            provider_guid_from_name("my-company-telemetry"),
            provider_guid_from_name("My-Company-Telemetry")
        );
    }

    #[test]
    fn hashed_guids_carry_version_five() {
        let guid = provider_guid_from_name("Some-Custom-Source");
        assert_eq!(guid.as_bytes()[7] >> 4, 5);
    }
}
