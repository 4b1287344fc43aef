use clap::Args;
use terraform_bench::{Difficulty, Filter};

pub mod list;
pub mod report;
pub mod run;

/// Options selecting which dataset instances to use.
#[derive(Args, Clone, Debug, Default)]
pub struct FilterArgs {
    /// Only the instance with this id.
    #[arg(long)]
    instance_id: Option<String>,

    /// Only instances of this difficulty (`easy`, `medium` or `hard`).
    #[arg(long)]
    difficulty: Option<Difficulty>,

    /// Only instances for this provider.
    #[arg(long)]
    provider: Option<String>,

    /// Only instances carrying this tag (can be specified multiple times).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// At most this many instances.
    #[arg(long)]
    limit: Option<usize>,
}

impl From<FilterArgs> for Filter {
    fn from(args: FilterArgs) -> Self {
        Filter::builder()
            .maybe_instance_id(args.instance_id)
            .maybe_difficulty(args.difficulty)
            .maybe_provider(args.provider)
            .tags(args.tags)
            .maybe_limit(args.limit)
            .build()
    }
}
