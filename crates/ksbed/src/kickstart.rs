// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Composition of the kickstart descriptor that makes an installation image
//! install itself without interaction.
//!
//! The composed descriptor is the image's own descriptor, byte for byte,
//! wrapped between a preamble and a postamble. The preamble supplies the
//! directives an unattended install needs (in the order the installer
//! expects them) and the postamble grants passwordless sudo to the test
//! accounts.

/// The two unprivileged accounts created in the guest. Both receive the SSH
/// key and passwordless sudo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestAccounts([String; 2]);

impl GuestAccounts {
    pub fn new(names: [String; 2]) -> Self {
        Self(names)
    }

    pub fn names(&self) -> &[String; 2] {
        &self.0
    }
}

/// Network and storage directives. They must come before `bootloader`.
const STORAGE_DIRECTIVES: &str = r#"network --bootproto=dhcp --device=link --activate --onboot=on
zerombr
clearpart --all --initlabel --disklabel=gpt
reqpart --add-boot
part / --fstype=xfs --grow
"#;

const SUDOERS_DROP_IN: &str = "/etc/sudoers.d/90-ksbed";

/// The fixed text placed around an image's original descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomizationPatch {
    preamble: String,
    postamble: String,
}

impl CustomizationPatch {
    /// Builds the patch for a guest reachable with `ssh_public_key` whose
    /// serial console uses `console_args`.
    pub fn new(
        accounts: &GuestAccounts,
        ssh_public_key: &str,
        console_args: &[&str],
    ) -> Self {
        let [first, second] = accounts.names();
        let preamble = format!(
            r#"{storage}bootloader --timeout=1 --append="{console}"
rootpw --lock
user --name={first} --groups=wheel --lock
user --name={second} --groups=wheel --lock
sshkey --username=root "{key}"
sshkey --username={first} "{key}"
sshkey --username={second} "{key}"
poweroff
"#,
            storage = STORAGE_DIRECTIVES,
            console = console_args.join(" "),
            key = ssh_public_key,
        );

        // The leading newline keeps `%post` on its own line even when the
        // original descriptor lacks a trailing newline.
        let postamble = format!(
            r#"
%post --erroronfail
cat > {sudoers} <<'EOF'
{first} ALL=(ALL) NOPASSWD: ALL
{second} ALL=(ALL) NOPASSWD: ALL
EOF
chmod 0440 {sudoers}
%end
"#,
            sudoers = SUDOERS_DROP_IN,
        );

        Self { preamble, postamble }
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn postamble(&self) -> &str {
        &self.postamble
    }

    /// Wraps `original` in the preamble and postamble. `original` is not
    /// parsed, reordered or re-encoded.
    pub fn compose(&self, original: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.preamble.len() + original.len() + self.postamble.len(),
        );
        out.extend_from_slice(self.preamble.as_bytes());
        out.extend_from_slice(original);
        out.extend_from_slice(self.postamble.as_bytes());
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKsbedtestkey ksbed@test";

    fn patch() -> CustomizationPatch {
        CustomizationPatch::new(
            &GuestAccounts::new(["admin".to_owned(), "tester".to_owned()]),
            KEY,
            &["console=ttyS0,115200n8", "quiet"],
        )
    }

    fn directive_position(text: &str, directive: &str) -> usize {
        text.lines()
            .position(|l| l.starts_with(directive))
            .unwrap_or_else(|| panic!("no {directive} directive"))
    }

    #[test]
    fn preamble_directives_are_in_installer_order() {
        let patch = patch();
        let pre = patch.preamble();
        let network = directive_position(pre, "network ");
        let clearpart = directive_position(pre, "clearpart ");
        let part = directive_position(pre, "part ");
        let bootloader = directive_position(pre, "bootloader ");
        let user = directive_position(pre, "user ");
        let sshkey = directive_position(pre, "sshkey ");
        let poweroff = directive_position(pre, "poweroff");

        assert!(network < clearpart);
        assert!(clearpart < part);
        assert!(part < bootloader);
        assert!(bootloader < user);
        assert!(user < sshkey);
        assert!(sshkey < poweroff);
    }

    #[test]
    fn preamble_carries_key_and_console() {
        let patch = patch();
        assert!(patch
            .preamble()
            .contains(&format!("sshkey --username=root \"{KEY}\"")));
        assert!(patch
            .preamble()
            .contains(&format!("sshkey --username=tester \"{KEY}\"")));
        assert!(patch
            .preamble()
            .contains("--append=\"console=ttyS0,115200n8 quiet\""));
    }

    #[test]
    fn postamble_grants_sudo_to_both_accounts() {
        let patch = patch();
        let post = patch.postamble();
        assert!(post.contains("\n%post"));
        assert!(post.trim_end().ends_with("%end"));
        assert!(post.contains("admin ALL=(ALL) NOPASSWD: ALL\n"));
        assert!(post.contains("tester ALL=(ALL) NOPASSWD: ALL\n"));
    }

    #[test]
    fn original_without_trailing_newline_keeps_post_on_its_own_line() {
        let composed = patch().compose(b"lang en_US.UTF-8");
        let text = String::from_utf8(composed).unwrap();
        assert!(text.contains("lang en_US.UTF-8\n%post --erroronfail\n"));
    }

    #[test]
    fn original_with_trailing_newline_is_followed_by_a_blank_line() {
        let composed = patch().compose(b"lang en_US.UTF-8\n");
        let text = String::from_utf8(composed).unwrap();
        assert!(text.contains("lang en_US.UTF-8\n\n%post --erroronfail\n"));
        assert_eq!(text.lines().filter(|l| *l == "%post --erroronfail").count(), 1);
    }

    #[test]
    fn preamble_is_exact() {
        let expected = format!(
            r#"network --bootproto=dhcp --device=link --activate --onboot=on
zerombr
clearpart --all --initlabel --disklabel=gpt
reqpart --add-boot
part / --fstype=xfs --grow
bootloader --timeout=1 --append="console=ttyS0,115200n8 quiet"
rootpw --lock
user --name=admin --groups=wheel --lock
user --name=tester --groups=wheel --lock
sshkey --username=root "{KEY}"
sshkey --username=admin "{KEY}"
sshkey --username=tester "{KEY}"
poweroff
"#
        );
        assert_eq!(patch().preamble(), expected);
    }

    #[test]
    fn postamble_is_exact() {
        let expected = r#"
%post --erroronfail
cat > /etc/sudoers.d/90-ksbed <<'EOF'
admin ALL=(ALL) NOPASSWD: ALL
tester ALL=(ALL) NOPASSWD: ALL
EOF
chmod 0440 /etc/sudoers.d/90-ksbed
%end
"#;
        assert_eq!(patch().postamble(), expected);
    }

    proptest! {
        #[test]
        fn original_is_embedded_verbatim(original in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let patch = patch();
            let composed = patch.compose(&original);
            let pre = patch.preamble().as_bytes();
            let post = patch.postamble().as_bytes();

            prop_assert_eq!(composed.len(), pre.len() + original.len() + post.len());
            prop_assert_eq!(&composed[..pre.len()], pre);
            prop_assert_eq!(&composed[pre.len()..pre.len() + original.len()], &original[..]);
            prop_assert_eq!(&composed[pre.len() + original.len()..], post);
        }
    }
}
