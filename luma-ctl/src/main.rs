use std::sync::Arc;

use anyhow::Context;
use luma_api::{AuthToken, Comment, CommentId, EntityId, EntityKind, EntityRef, UserId, Uuid};
use luma_client::{flatten_all, CommentForest, CommentStore, LiveSync, Session};
use structopt::StructOpt;

mod api;

use api::HttpBackend;

#[derive(StructOpt)]
#[structopt(name = "luma-ctl", about = "Read and write comment sections")]
struct Opt {
    /// Base url of the luma server
    #[structopt(short, long, env = "LUMA_HOST")]
    host: String,

    /// Session token handed out by the authentication service
    #[structopt(long, env = "LUMA_TOKEN", hide_env_values = true)]
    token: Uuid,

    /// Name displayed on new comments
    #[structopt(long, env = "LUMA_NAME", default_value = "")]
    name: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
struct EntityArgs {
    /// post or profile
    #[structopt(long, default_value = "post")]
    kind: EntityKind,

    /// Id of the post or profile
    #[structopt(long)]
    entity: Uuid,

    /// User who owns the post or profile
    #[structopt(long)]
    owner: Uuid,
}

impl EntityArgs {
    fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind,
            id: EntityId(self.entity),
            owner_id: UserId(self.owner),
        }
    }
}

#[derive(StructOpt)]
enum Command {
    /// Print a comment section as a tree
    List {
        #[structopt(flatten)]
        entity: EntityArgs,
    },

    /// Post a comment, or a reply with --reply-to
    Post {
        #[structopt(flatten)]
        entity: EntityArgs,

        #[structopt(long)]
        reply_to: Option<Uuid>,

        text: String,
    },

    /// Change the text of one of your comments
    Edit { comment: Uuid, text: String },

    /// Delete a single comment
    Delete { comment: Uuid },

    /// Delete a comment and all its replies
    DeleteThread {
        #[structopt(flatten)]
        entity: EntityArgs,

        root: Uuid,
    },

    /// Print your own comments, newest first
    Mine,

    /// Print the comment section every time it changes, until interrupted
    Watch {
        #[structopt(flatten)]
        entity: EntityArgs,
    },
}

fn print_section(comments: Vec<Comment>) {
    let forest = CommentForest::build(comments);
    if forest.is_empty() {
        println!("(no comments)");
        return;
    }
    for row in flatten_all(&forest) {
        let c = &row.node.comment;
        let op = if c.is_original_poster { " [OP]" } else { "" };
        let edited = if c.updated_at.is_some() { " (edited)" } else { "" };
        println!(
            "{:indent$}{} {}{op}, {}{edited}:",
            "",
            c.id.0,
            c.author_name,
            c.created_at.format("%Y-%m-%d %H:%M"),
            indent = 2 * row.depth,
        );
        for line in c.text.lines() {
            println!("{:indent$}  {line}", "", indent = 2 * row.depth);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();

    let backend = Arc::new(HttpBackend::new(opt.host, AuthToken(opt.token)));
    let user = backend.whoami().await.context("recovering session")?;
    let store = CommentStore::new(backend.clone(), Session::new(user, opt.name));

    match opt.cmd {
        Command::List { entity } => {
            let comments = store
                .list_comments(&entity.entity_ref())
                .await
                .context("listing comments")?;
            print_section(comments);
        }
        Command::Post {
            entity,
            reply_to,
            text,
        } => {
            let id = store
                .create_comment(&entity.entity_ref(), reply_to.map(CommentId), text)
                .await
                .context("posting comment")?;
            println!("{}", id.0);
        }
        Command::Edit { comment, text } => {
            store
                .edit_comment(CommentId(comment), text)
                .await
                .context("editing comment")?;
        }
        Command::Delete { comment } => {
            store
                .delete_comment(CommentId(comment))
                .await
                .context("deleting comment")?;
        }
        Command::DeleteThread { entity, root } => {
            let ids = store
                .delete_thread(&entity.entity_ref(), CommentId(root))
                .await
                .context("deleting thread")?;
            println!("deleted {} comments", ids.len());
        }
        Command::Mine => {
            let comments = store
                .list_my_comments()
                .await
                .context("listing your comments")?;
            if comments.is_empty() {
                println!("(no comments)");
            }
            for c in comments {
                println!(
                    "{} on {} {}, {}:",
                    c.id.0,
                    c.entity.kind,
                    c.entity.id.0,
                    c.created_at.format("%Y-%m-%d %H:%M"),
                );
                for line in c.text.lines() {
                    println!("  {line}");
                }
            }
        }
        Command::Watch { entity } => {
            let sub = LiveSync::new(backend).subscribe(entity.entity_ref(), |comments| {
                println!("----");
                print_section(comments);
            });
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interruption")?;
            sub.unsubscribe().await;
        }
    }

    Ok(())
}
