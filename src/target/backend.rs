//! Backend, architecture, and image kinds plus the static descriptor table.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::session::ShellDialect;

/// Raised when a name does not match any known kind.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown {kind} `{value}` (expected one of: {expected})")]
pub struct ParseKindError {
    /// What was being parsed.
    pub kind: &'static str,
    /// Rejected input.
    pub value: String,
    /// Accepted spellings.
    pub expected: String,
}

/// A virtualization or cloud target.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BackendKind {
    /// Oracle VirtualBox on a cloud instance.
    VirtualBox,
    /// VMware Desktop on a cloud instance.
    VmwareDesktop,
    /// Hyper-V on a Windows cloud instance.
    HyperV,
    /// KVM/QEMU on a cloud instance.
    Kvm,
    /// The instance consuming the first AMI stage's output.
    AwsStage2,
    /// Bare-metal ARM host provisioned out of band.
    Equinix,
}

impl BackendKind {
    /// Every backend in CLI order.
    pub const ALL: [Self; 6] = [
        Self::VirtualBox,
        Self::VmwareDesktop,
        Self::HyperV,
        Self::Kvm,
        Self::AwsStage2,
        Self::Equinix,
    ];

    /// CLI spelling, also the descriptor directory name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VirtualBox => "virtualbox",
            Self::VmwareDesktop => "vmware_desktop",
            Self::HyperV => "hyperv",
            Self::Kvm => "kvm",
            Self::AwsStage2 => "aws-stage-2",
            Self::Equinix => "equinix",
        }
    }

    /// Static description of this backend.
    #[must_use]
    pub fn descriptor(self) -> &'static BackendDescriptor {
        match self {
            Self::VirtualBox => &VIRTUALBOX,
            Self::VmwareDesktop => &VMWARE_DESKTOP,
            Self::HyperV => &HYPERV,
            Self::Kvm => &KVM,
            Self::AwsStage2 => &AWS_STAGE_2,
            Self::Equinix => &EQUINIX,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| ParseKindError {
                kind: "backend",
                value: value.to_owned(),
                expected: Self::ALL.map(Self::as_str).join(", "),
            })
    }
}

/// CPU architecture of the produced image.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Architecture {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Aarch64,
}

impl Architecture {
    /// Canonical spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// Spelling used by the test-instance descriptors (`amd64`, `aarch64`).
    #[must_use]
    pub const fn descriptor_alias(self) -> &'static str {
        match self {
            Self::X86_64 => "amd64",
            Self::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            _ => Err(ParseKindError {
                kind: "architecture",
                value: value.to_owned(),
                expected: String::from("x86_64, aarch64"),
            }),
        }
    }
}

/// Kind of image a build produces.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ImageKind {
    /// Vagrant box published to the box registry.
    VagrantBox,
    /// qcow2 cloud image released to the mirror.
    GenericCloud,
    /// Amazon machine image.
    AwsAmi,
    /// qcow2 image for OpenNebula released to the mirror.
    OpenNebula,
}

impl ImageKind {
    /// Every image kind.
    pub const ALL: [Self; 4] = [
        Self::VagrantBox,
        Self::GenericCloud,
        Self::AwsAmi,
        Self::OpenNebula,
    ];

    /// Human label, as configured.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::VagrantBox => "Vagrant Box",
            Self::GenericCloud => "Generic Cloud",
            Self::AwsAmi => "AWS AMI",
            Self::OpenNebula => "OpenNebula",
        }
    }

    /// Label with spaces replaced, used in keys and file names.
    #[must_use]
    pub fn slug(self) -> String {
        self.label().replace(' ', "_")
    }

    /// Remote glob patterns, relative to the working tree, of the files a
    /// successful build leaves behind.
    #[must_use]
    pub fn artifact_patterns(self, arch: Architecture) -> Vec<String> {
        match self {
            Self::VagrantBox => vec![String::from("*.box")],
            Self::GenericCloud => vec![format!("output-almalinux-8-gencloud-{arch}/*.qcow2")],
            Self::OpenNebula => vec![format!("output-almalinux-8-opennebula-{arch}/*.qcow2")],
            Self::AwsAmi => Vec::new(),
        }
    }

    /// Family name used in released qcow2 file names.
    #[must_use]
    pub const fn release_family(self) -> &'static str {
        match self {
            Self::VagrantBox => "Vagrant",
            Self::GenericCloud => "GenericCloud",
            Self::AwsAmi => "AMI",
            Self::OpenNebula => "OpenNebula",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ImageKind {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().replace(['_', '-'], " ").to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.label().to_ascii_lowercase() == wanted)
            .ok_or_else(|| ParseKindError {
                kind: "image",
                value: value.to_owned(),
                expected: Self::ALL.map(Self::label).join(", "),
            })
    }
}

/// How a backend's build instance comes into existence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisioningMode {
    /// A terraform descriptor creates and removes the instance.
    Terraform,
    /// The host exists already at a configured address.
    BareMetal,
}

/// One-time host preparation run by `init`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigureMode {
    /// Write an inventory and run the configuration playbook locally.
    Ansible,
    /// Clone the image-definition repository on the host.
    GitClone,
    /// Nothing to prepare.
    None,
}

/// A build command template for one image kind.
#[derive(Debug)]
pub struct BuildRecipe {
    /// Image kind built.
    pub image: ImageKind,
    /// Restricts the recipe to one architecture.
    pub arch: Option<Architecture>,
    /// Command template with `{images}`, `{log}`, `{arch}`, and `{bucket}`
    /// placeholders, written in the backend's login shell.
    pub template: &'static str,
}

/// Static facts about a backend.
#[derive(Debug)]
pub struct BackendDescriptor {
    /// Backend described.
    pub kind: BackendKind,
    /// Provisioning mode.
    pub provisioning: ProvisioningMode,
    /// Init-time preparation.
    pub configure: ConfigureMode,
    /// Login shell of the build user.
    pub shell: ShellDialect,
    /// Build user.
    pub login_user: &'static str,
    /// Home directory, as seen by a POSIX shell on the host.
    pub home: &'static str,
    /// Image-definition working tree, as seen by a POSIX shell on the host.
    pub working_dir: &'static str,
    /// The same working tree, as seen by the login shell.
    pub native_working_dir: &'static str,
    /// The same working tree, as addressed by scp.
    pub transfer_root: &'static str,
    /// Supported architectures.
    pub architectures: &'static [Architecture],
    /// Command initialising the image-build tool, in the login shell.
    pub packer_init: &'static str,
    /// Build commands per image kind.
    pub recipes: &'static [BuildRecipe],
    /// Provider name registered with the box registry.
    pub box_provider: Option<&'static str>,
}

impl BackendDescriptor {
    /// Finds the recipe building `image` on `arch`.
    #[must_use]
    pub fn recipe(&self, image: ImageKind, arch: Architecture) -> Option<&'static BuildRecipe> {
        let recipes: &'static [BuildRecipe] = self.recipes;
        recipes
            .iter()
            .find(|recipe| recipe.image == image && recipe.arch.is_none_or(|only| only == arch))
    }
}

const LINUX_HOME: &str = "/home/ec2-user";
const LINUX_IMAGES: &str = "/home/ec2-user/cloud-images";

static VIRTUALBOX: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::VirtualBox,
    provisioning: ProvisioningMode::Terraform,
    configure: ConfigureMode::Ansible,
    shell: ShellDialect::Posix,
    login_user: "ec2-user",
    home: LINUX_HOME,
    working_dir: LINUX_IMAGES,
    native_working_dir: LINUX_IMAGES,
    transfer_root: LINUX_IMAGES,
    architectures: &[Architecture::X86_64],
    packer_init: "cd {images} && packer init .",
    recipes: &[BuildRecipe {
        image: ImageKind::VagrantBox,
        arch: None,
        template: "cd {images} && packer build -only=virtualbox-iso.almalinux-8 . 2>&1 | tee ./{log}",
    }],
    box_provider: Some("virtualbox"),
};

static VMWARE_DESKTOP: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::VmwareDesktop,
    provisioning: ProvisioningMode::Terraform,
    configure: ConfigureMode::Ansible,
    shell: ShellDialect::Posix,
    login_user: "ec2-user",
    home: LINUX_HOME,
    working_dir: LINUX_IMAGES,
    native_working_dir: LINUX_IMAGES,
    transfer_root: LINUX_IMAGES,
    architectures: &[Architecture::X86_64],
    packer_init: "cd {images} && packer init .",
    recipes: &[BuildRecipe {
        image: ImageKind::VagrantBox,
        arch: None,
        template: "cd {images} && packer build -only=vmware-iso.almalinux-8 . 2>&1 | tee ./{log}",
    }],
    box_provider: Some("vmware_desktop"),
};

static HYPERV: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::HyperV,
    provisioning: ProvisioningMode::Terraform,
    configure: ConfigureMode::GitClone,
    shell: ShellDialect::PowerShell,
    login_user: "Administrator",
    home: "/mnt/c/Users/Administrator",
    working_dir: "/mnt/c/Users/Administrator/cloud-images",
    native_working_dir: "C:\\Users\\Administrator\\cloud-images",
    transfer_root: "C:/Users/Administrator/cloud-images",
    architectures: &[Architecture::X86_64],
    packer_init: "cd {images}; packer init .",
    recipes: &[BuildRecipe {
        image: ImageKind::VagrantBox,
        arch: None,
        template: "cd {images}; packer build -var hyperv_switch_name=\"HyperV-vSwitch\" -only=\"hyperv-iso.almalinux-8\" . | Tee-Object -file {images}\\{log}",
    }],
    box_provider: Some("hyperv"),
};

static KVM: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Kvm,
    provisioning: ProvisioningMode::Terraform,
    configure: ConfigureMode::Ansible,
    shell: ShellDialect::Posix,
    login_user: "ec2-user",
    home: LINUX_HOME,
    working_dir: LINUX_IMAGES,
    native_working_dir: LINUX_IMAGES,
    transfer_root: LINUX_IMAGES,
    architectures: &[Architecture::X86_64, Architecture::Aarch64],
    packer_init: "cd {images} && packer init .",
    recipes: &[
        BuildRecipe {
            image: ImageKind::VagrantBox,
            arch: Some(Architecture::X86_64),
            template: "cd {images} && packer build -var qemu_binary='/usr/libexec/qemu-kvm' -only=qemu.almalinux-8 . 2>&1 | tee ./{log}",
        },
        BuildRecipe {
            image: ImageKind::GenericCloud,
            arch: Some(Architecture::X86_64),
            template: "cd {images} && packer build -var qemu_binary='/usr/libexec/qemu-kvm' -only=qemu.almalinux-8-gencloud-{arch} . 2>&1 | tee ./{log}",
        },
        BuildRecipe {
            image: ImageKind::OpenNebula,
            arch: Some(Architecture::X86_64),
            template: "cd {images} && packer build -var qemu_binary='/usr/libexec/qemu-kvm' -only=qemu.almalinux-8-opennebula-{arch} . 2>&1 | tee ./{log}",
        },
        BuildRecipe {
            image: ImageKind::AwsAmi,
            arch: Some(Architecture::X86_64),
            template: "cd {images} && packer build -var aws_s3_bucket_name={bucket} -var qemu_binary='/usr/libexec/qemu-kvm' -only=qemu.almalinux-8-aws-stage1 . 2>&1 | tee ./{log}",
        },
        BuildRecipe {
            image: ImageKind::AwsAmi,
            arch: Some(Architecture::Aarch64),
            template: "cd {images} && packer build -var aws_s3_bucket_name={bucket} -only=amazon-ebssurrogate.almalinux-8-aws-aarch64 . 2>&1 | tee ./{log}",
        },
    ],
    box_provider: Some("libvirt"),
};

static AWS_STAGE_2: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::AwsStage2,
    provisioning: ProvisioningMode::Terraform,
    configure: ConfigureMode::None,
    shell: ShellDialect::Posix,
    login_user: "ec2-user",
    home: LINUX_HOME,
    working_dir: LINUX_IMAGES,
    native_working_dir: LINUX_IMAGES,
    transfer_root: LINUX_IMAGES,
    architectures: &[Architecture::X86_64],
    packer_init: "cd {images} && sudo packer.io init .",
    recipes: &[BuildRecipe {
        image: ImageKind::AwsAmi,
        arch: None,
        template: "cd {images} && sudo --preserve-env=AWS_ACCESS_KEY_ID,AWS_SECRET_ACCESS_KEY,AWS_DEFAULT_REGION packer.io build -only=amazon-chroot.almalinux-8-aws-stage2 . 2>&1 | tee ./{log}",
    }],
    box_provider: None,
};

static EQUINIX: BackendDescriptor = BackendDescriptor {
    kind: BackendKind::Equinix,
    provisioning: ProvisioningMode::BareMetal,
    configure: ConfigureMode::GitClone,
    shell: ShellDialect::Posix,
    login_user: "root",
    home: "/root",
    working_dir: "/root/cloud-images",
    native_working_dir: "/root/cloud-images",
    transfer_root: "/root/cloud-images",
    architectures: &[Architecture::Aarch64],
    packer_init: "cd {images} && packer.io init .",
    recipes: &[
        BuildRecipe {
            image: ImageKind::GenericCloud,
            arch: None,
            template: "cd {images} && packer.io build -var qemu_binary='/usr/libexec/qemu-kvm' -only=qemu.almalinux-8-gencloud-{arch} . 2>&1 | tee ./{log}",
        },
        BuildRecipe {
            image: ImageKind::OpenNebula,
            arch: None,
            template: "cd {images} && packer.io build -var qemu_binary='/usr/libexec/qemu-kvm' -only=qemu.almalinux-8-opennebula-{arch} . 2>&1 | tee ./{log}",
        },
    ],
    box_provider: None,
};
