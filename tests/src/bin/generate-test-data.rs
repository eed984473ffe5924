use std::collections::HashMap;

use chrono::{Duration, Utc};
use rand::{seq::SliceRandom, Rng};
use uuid::Uuid;

const NUM_USERS: usize = 5;
const NUM_ENTITIES: usize = 20;
const NUM_COMMENTS: usize = 400;

// Odds that a generated comment replies to an earlier one of the same entity
const REPLY_PROBABILITY: f64 = 0.6;
const ANONYMOUS_PROBABILITY: f64 = 0.1;
const EDITED_PROBABILITY: f64 = 0.15;

const COMMENT_MAX_WORDS: usize = 40;

fn gen_n_items(table: &str, columns: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    println!("INSERT INTO {} ({}) VALUES", table, columns);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

struct Entity {
    kind: &'static str,
    id: Uuid,
    owner: usize,
}

fn main() {
    let mut rng = rand::thread_rng();

    // Users only exist through their sessions and names
    let users = (0..NUM_USERS)
        .map(|_| (Uuid::new_v4(), lipsum::lipsum_words(1)))
        .collect::<Vec<_>>();
    let tokens = (0..NUM_USERS).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    for ((user, name), token) in users.iter().zip(&tokens) {
        println!("-- user {name} ({user}) has token {token}");
    }
    gen_n_items("sessions", "id, user_id", NUM_USERS, |i| {
        format!("('{}', '{}')", tokens[i], users[i].0)
    });

    let entities = (0..NUM_ENTITIES)
        .map(|_| Entity {
            kind: *["post", "profile"].choose(&mut rng).unwrap(),
            id: Uuid::new_v4(),
            owner: rng.gen_range(0..NUM_USERS),
        })
        .collect::<Vec<_>>();
    gen_n_items("entities", "id, kind, owner_id", NUM_ENTITIES, |i| {
        let e = &entities[i];
        format!("('{}', '{}', '{}')", e.id, e.kind, users[e.owner].0)
    });

    // Creation times strictly increase, so that parents are always older
    let mut time = Utc::now() - Duration::days(30);
    let mut by_entity: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    gen_n_items(
        "comments",
        "id, entity_kind, entity_id, entity_owner_id, parent_id, author_id, author_name, \
         text, created_at, updated_at, is_original_poster",
        NUM_COMMENTS,
        |_| {
            let id = Uuid::new_v4();
            let entity = entities.choose(&mut rng).unwrap();
            let earlier = by_entity.entry(entity.id).or_default();
            let parent = match earlier.choose(&mut rng) {
                Some(p) if rng.gen_bool(REPLY_PROBABILITY) => format!("'{p}'"),
                _ => String::from("NULL"),
            };
            earlier.push(id);

            let author = rng.gen_range(0..NUM_USERS);
            let name = match rng.gen_bool(ANONYMOUS_PROBABILITY) {
                true => String::new(),
                false => users[author].1.clone(),
            };
            let text = lipsum::lipsum_words(rng.gen_range(1..=COMMENT_MAX_WORDS));

            time = time + Duration::seconds(rng.gen_range(1..3600));
            let updated = match rng.gen_bool(EDITED_PROBABILITY) {
                true => format!(
                    "'{}'",
                    (time + Duration::minutes(rng.gen_range(1..120))).to_rfc3339()
                ),
                false => String::from("NULL"),
            };
            format!(
                "('{}', '{}', '{}', '{}', {}, '{}', {}, {}, '{}', {}, {})",
                id,
                entity.kind,
                entity.id,
                users[entity.owner].0,
                parent,
                users[author].0,
                sql_string(&name),
                sql_string(&text),
                time.to_rfc3339(),
                updated,
                author == entity.owner,
            )
        },
    );
}
