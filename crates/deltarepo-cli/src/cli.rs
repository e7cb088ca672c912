use clap::{ArgAction, Parser, Subcommand, ValueHint};

#[derive(Parser)]
#[command(
    author,
    version,
    about,
    help_template = "{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}",
    arg_required_else_help = true
)]
pub struct Args {
    /// Set output verbosity
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress outputs
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output as json
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Disable colors in output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Provide custom config file
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    pub config: Option<String>,

    /// Set proxy
    #[arg(required = false, long, short = 'P', global = true)]
    pub proxy: Option<String>,

    /// Set request headers
    #[arg(required = false, long, short = 'H', global = true)]
    pub header: Option<Vec<String>>,

    /// Set user agent
    #[arg(required = false, long, short = 'A', global = true)]
    pub user_agent: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a delta between two repositories
    #[command(arg_required_else_help = true)]
    #[clap(name = "gen", visible_alias = "generate")]
    Generate {
        /// The older repository
        #[arg(value_hint = ValueHint::DirPath)]
        old: String,

        /// The newer repository
        #[arg(value_hint = ValueHint::DirPath)]
        new: String,

        /// Directory the delta repository is written into
        #[arg(required = false, short, long, value_hint = ValueHint::DirPath)]
        outdir: Option<String>,

        /// Checksum used for the content hashes
        #[arg(required = false, long)]
        id_type: Option<String>,

        /// Metadata kinds left out of the delta
        #[arg(required = false, long, value_delimiter = ',', conflicts_with = "only")]
        skip: Vec<String>,

        /// Only these metadata kinds go into the delta
        #[arg(required = false, long, value_delimiter = ',')]
        only: Vec<String>,

        /// Ask for sqlite databases in the repository built from the delta
        #[arg(required = false, long)]
        database: bool,

        /// Only warn about metadata files that don't exist
        #[arg(required = false, long)]
        ignore_missing: bool,

        /// Compression of the generated files
        #[arg(required = false, long)]
        compression: Option<String>,

        /// Checksum of the delta records
        #[arg(required = false, long)]
        checksum: Option<String>,
    },

    /// Build a new repository from an old one and a delta
    #[command(arg_required_else_help = true)]
    Apply {
        /// The repository the delta starts from
        #[arg(value_hint = ValueHint::DirPath)]
        old: String,

        /// The delta repository
        #[arg(value_hint = ValueHint::DirPath)]
        delta: String,

        /// Directory the new repository is written into
        #[arg(required = false, short, long, value_hint = ValueHint::DirPath)]
        outdir: Option<String>,

        /// Always build sqlite databases
        #[arg(required = false, long)]
        database: bool,

        /// Only warn about metadata files that don't exist
        #[arg(required = false, long)]
        ignore_missing: bool,
    },

    /// Rebuild the delta index of a directory of delta repositories
    #[command(arg_required_else_help = true)]
    Index {
        #[arg(value_hint = ValueHint::DirPath)]
        dir: String,

        /// Skip delta repositories that can't be read instead of failing
        #[arg(required = false, short, long)]
        force: bool,
    },

    /// Generate a delta into a delta directory and add it to its index
    #[command(arg_required_else_help = true)]
    Add {
        #[arg(value_hint = ValueHint::DirPath)]
        old: String,

        #[arg(value_hint = ValueHint::DirPath)]
        new: String,

        /// Directory holding the delta repositories and their index
        #[arg(value_hint = ValueHint::DirPath)]
        dir: String,
    },

    /// Show the deltas needed to update a local repository
    #[command(arg_required_else_help = true)]
    Resolve {
        #[arg(value_hint = ValueHint::DirPath)]
        local: String,

        /// Delta mirrors to use instead of the configured ones
        #[arg(required = false, short, long)]
        mirror: Vec<String>,

        /// Content hash to update to. Defaults to the newest one known
        #[arg(required = false, short, long)]
        target: Option<String>,
    },

    /// Update a local repository through deltas
    #[command(arg_required_else_help = true)]
    #[clap(name = "update", visible_alias = "u")]
    Update {
        #[arg(value_hint = ValueHint::DirPath)]
        local: String,

        /// Delta mirrors to use instead of the configured ones
        #[arg(required = false, short, long)]
        mirror: Vec<String>,

        /// Content hash to update to. Defaults to the newest one known
        #[arg(required = false, short, long)]
        target: Option<String>,
    },

    /// Print the content hash of a repository
    #[command(arg_required_else_help = true)]
    Contenthash {
        #[arg(value_hint = ValueHint::DirPath)]
        repo: String,

        /// Checksum used for the content hash
        #[arg(required = false, short = 't', long = "type")]
        hash_type: Option<String>,
    },

    /// Generate default config
    #[clap(name = "defconfig")]
    DefConfig {
        /// Delta mirrors written into the config
        #[arg(required = false, short, long, num_args = 0.., value_delimiter = ',')]
        mirror: Vec<String>,
    },
}
